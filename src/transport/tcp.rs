//! Direct TCP dialing and listener binding

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

/// Fixed timeout for direct outbound dials
pub const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dial `addr` directly over TCP, bounded by `timeout`
pub async fn connect_direct(addr: &Address, timeout: Duration) -> Result<Stream> {
    let connect = async {
        match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    };

    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| Error::Timeout)??;

    // Disable Nagle's algorithm for lower latency
    stream.set_nodelay(true)?;
    trace!("Direct connection to {} established", addr);

    Ok(Box::new(stream))
}

/// Bind the client-facing TCP listener on a `host:port` string
pub async fn bind_listener(bind: &str) -> Result<TcpListener> {
    TcpListener::bind(bind)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind {}: {}", bind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_direct_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let mut stream = connect_direct(&Address::from(addr), DIRECT_DIAL_TIMEOUT)
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_direct_refused() {
        // Grab a free port, then close it again
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let result = connect_direct(&Address::from(addr), DIRECT_DIAL_TIMEOUT).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
