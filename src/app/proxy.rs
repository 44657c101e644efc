//! Proxy instance - listener, acceptor and per-connection handling
//!
//! One `Proxy` owns one listening socket. The acceptor task is the only
//! activity registered with the shutdown coordinator; connection handlers
//! and relays run detached and end with their sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{IntoStream, Metadata, Result};
use crate::protocol::ProxyProtocol;
use crate::router::Dialer;
use crate::shutdown::{Coordinator, WorkGuard};
use crate::transport::bind_listener;

use super::metrics::{CONNECTIONS_FAILED, CONNECTIONS_TOTAL};

/// A running proxy listener. Not restartable after `close`.
pub struct Proxy {
    local_addr: SocketAddr,
    token: CancellationToken,
    dialer: Arc<Dialer>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Proxy {
    /// Bind `bind` and start accepting.
    ///
    /// The acceptor observes a child of the coordinator's token, so either
    /// `close` or a coordinator shutdown stops it.
    pub async fn start(
        bind: &str,
        protocol: Box<dyn ProxyProtocol>,
        dialer: Arc<Dialer>,
        coordinator: &Coordinator,
    ) -> Result<Self> {
        let listener = bind_listener(bind).await?;
        let local_addr = listener.local_addr()?;
        let protocol: Arc<dyn ProxyProtocol> = Arc::from(protocol);
        info!(
            "[{}] Listening (protocol: {}, tunnel: {})",
            local_addr,
            protocol.name(),
            dialer.tunnel().name()
        );

        let token = coordinator.token().child_token();
        let acceptor = tokio::spawn(run_acceptor(Acceptor {
            listener,
            local_addr,
            protocol,
            dialer: Arc::clone(&dialer),
            token: token.clone(),
            _work: coordinator.work_guard(),
        }));

        Ok(Self {
            local_addr,
            token,
            dialer,
            acceptor: Mutex::new(Some(acceptor)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the acceptor has been told to stop
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting, release the listener and close the tunnel.
    ///
    /// Idempotent; in-flight relays keep running until their peers close.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.token.cancel();
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            if let Err(e) = acceptor.await {
                warn!("[{}] Acceptor task failed: {}", self.local_addr, e);
            }
        }
        self.dialer.tunnel().close().await;

        info!("[{}] Closed", self.local_addr);
    }
}

struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    protocol: Arc<dyn ProxyProtocol>,
    dialer: Arc<Dialer>,
    token: CancellationToken,
    /// Held for the acceptor's lifetime; completes the coordinator work on drop
    _work: WorkGuard,
}

async fn run_acceptor(acceptor: Acceptor) {
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = acceptor.token.cancelled() => {
                info!("[{}] Shutting down (handled {} connections)", acceptor.local_addr, conn_count);
                break;
            }
            result = acceptor.listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        conn_count += 1;
                        debug!("[{}] New connection #{} from {}", acceptor.local_addr, conn_count, source);

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("[{}] set_nodelay failed: {}", acceptor.local_addr, e);
                        }

                        CONNECTIONS_TOTAL
                            .with_label_values(&[acceptor.protocol.name()])
                            .inc();

                        let metadata = Metadata::new(acceptor.local_addr, source)
                            .with_protocol(acceptor.protocol.name());
                        tokio::spawn(handle_connection(
                            Arc::clone(&acceptor.protocol),
                            Arc::clone(&acceptor.dialer),
                            stream.into_stream(),
                            metadata,
                        ));
                    }
                    Err(e) => {
                        // A broken listener takes the whole proxy down
                        error!("[{}] Accept error: {}", acceptor.local_addr, e);
                        acceptor.token.cancel();
                        acceptor.dialer.tunnel().close().await;
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    protocol: Arc<dyn ProxyProtocol>,
    dialer: Arc<Dialer>,
    stream: crate::common::Stream,
    mut metadata: Metadata,
) {
    match protocol.serve(stream, &mut metadata, &dialer).await {
        Ok(_relay) => {
            debug!(
                "[{}] {} relaying {} via {}",
                metadata.listener,
                metadata.source,
                metadata.target(),
                metadata.route.map(|r| r.as_str()).unwrap_or("-")
            );
        }
        Err(e) => {
            CONNECTIONS_FAILED.with_label_values(&[e.kind()]).inc();
            warn!(
                "[{}] {} {} connect failed: {}",
                metadata.listener,
                metadata.source,
                metadata.protocol,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{direct_dialer, echo_server};
    use crate::protocol::{HttpProtocol, Socks5Protocol};
    use crate::shutdown::DrainOutcome;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(protocol: Box<dyn ProxyProtocol>, coordinator: &Coordinator) -> Proxy {
        Proxy::start("127.0.0.1:0", protocol, Arc::new(direct_dialer()), coordinator)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_socks5_end_to_end() {
        let coordinator = Coordinator::default();
        let target = echo_server().await;
        let proxy = start(Box::new(Socks5Protocol), &coordinator).await;

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let port = target.port().to_be_bytes();
        client
            .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);

        client.write_all(b"round trip").await.unwrap();
        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"round trip");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_http_connect_end_to_end() {
        let coordinator = Coordinator::default();
        let target = echo_server().await;
        let proxy = start(Box::new(HttpProtocol), &coordinator).await;

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();

        let expected = b"HTTP/1.0 200 Connection Established\r\n\r\n";
        let mut response = vec![0u8; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, expected);

        client.write_all(b"abc").await.unwrap();
        let mut echoed = [0u8; 3];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"abc");

        proxy.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_work_and_listener() {
        let coordinator = Coordinator::default();
        let proxy = start(Box::new(Socks5Protocol), &coordinator).await;
        assert_eq!(coordinator.outstanding(), 1);

        proxy.close().await;
        proxy.close().await;

        assert!(proxy.is_closed());
        assert_eq!(coordinator.outstanding(), 0);
        assert!(TcpStream::connect(proxy.local_addr()).await.is_err());
        // Closing the proxy does not shut the process down
        assert!(!coordinator.is_cancelled());
    }

    #[tokio::test]
    async fn test_coordinator_shutdown_stops_acceptor() {
        let coordinator = Coordinator::default();
        let proxy = start(Box::new(HttpProtocol), &coordinator).await;

        assert_eq!(coordinator.await_shutdown_complete().await, DrainOutcome::Clean);
        assert!(proxy.is_closed());
        assert_eq!(coordinator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_bind_error() {
        let coordinator = Coordinator::default();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = taken.local_addr().unwrap().to_string();

        let result = Proxy::start(
            &bind,
            Box::new(Socks5Protocol),
            Arc::new(direct_dialer()),
            &coordinator,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(coordinator.outstanding(), 0);
    }
}
