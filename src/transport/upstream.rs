//! Upstream relay tunnel
//!
//! Reaches destinations through a SOCKS5 or HTTP CONNECT relay, optionally
//! over TLS. Each `connect` opens a fresh relay connection and runs the
//! client side of the relay's handshake before handing the stream back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::tcp::connect_direct;
use super::tls::{TlsConfig, TlsWrapper};
use super::Tunnel;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Upper bound for a relay's CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Handshake spoken with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    Socks5,
    Http,
}

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Socks5 => "socks5",
            UpstreamProtocol::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// Tunnel through an upstream relay
pub struct UpstreamTunnel {
    server: Address,
    protocol: UpstreamProtocol,
    credentials: Option<Credentials>,
    tls: Option<TlsWrapper>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl UpstreamTunnel {
    pub fn new(
        server: Address,
        protocol: UpstreamProtocol,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server,
            protocol,
            credentials: None,
            tls: None,
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Authenticate with username/password
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Wrap relay connections in TLS
    pub fn with_tls(mut self, config: &TlsConfig) -> Result<Self> {
        self.tls = Some(TlsWrapper::new(config, &self.server.host())?);
        Ok(self)
    }
}

#[async_trait]
impl Tunnel for UpstreamTunnel {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        debug!("[tunnel] {} -> {} via {}", self.protocol.as_str(), addr, self.server);

        let stream = connect_direct(&self.server, self.connect_timeout).await?;

        // TLS and the relay handshake share one budget
        let handshake = async move {
            let mut stream = match &self.tls {
                Some(tls) => tls.wrap(stream).await?,
                None => stream,
            };
            match self.protocol {
                UpstreamProtocol::Socks5 => {
                    socks5_handshake(&mut stream, addr, self.credentials.as_ref()).await?
                }
                UpstreamProtocol::Http => {
                    http_handshake(&mut stream, addr, self.credentials.as_ref()).await?
                }
            }
            Ok::<Stream, Error>(stream)
        };

        tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("[tunnel] closed ({})", self.server);
        }
    }

    fn name(&self) -> &'static str {
        self.protocol.as_str()
    }
}

async fn socks5_handshake<S>(
    stream: &mut S,
    target: &Address,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Greeting
    let method = if credentials.is_some() {
        AUTH_PASSWORD
    } else {
        AUTH_NONE
    };
    stream.write_all(&[SOCKS5_VERSION, 1, method]).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[0] != SOCKS5_VERSION {
        return Err(Error::Tunnel("Invalid SOCKS version from relay".into()));
    }
    if response[1] == AUTH_NO_ACCEPTABLE {
        return Err(Error::Tunnel("Relay rejected auth methods".into()));
    }

    // 2. Username/password sub-negotiation
    if response[1] == AUTH_PASSWORD {
        let creds = credentials
            .ok_or_else(|| Error::Tunnel("Relay requires authentication".into()))?;
        if creds.username.len() > 255 || creds.password.len() > 255 {
            return Err(Error::Config("SOCKS5 credentials longer than 255 bytes".into()));
        }

        let mut auth = vec![AUTH_PASSWORD_VERSION, creds.username.len() as u8];
        auth.extend_from_slice(creds.username.as_bytes());
        auth.push(creds.password.len() as u8);
        auth.extend_from_slice(creds.password.as_bytes());
        stream.write_all(&auth).await?;

        let mut auth_response = [0u8; 2];
        stream.read_exact(&mut auth_response).await?;
        if auth_response[1] != REP_SUCCESS {
            return Err(Error::Tunnel("Relay authentication failed".into()));
        }
    }

    // 3. CONNECT request
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        Address::Socket(SocketAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
            request.extend_from_slice(&v4.port().to_be_bytes());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
            request.extend_from_slice(&v6.port().to_be_bytes());
        }
        Address::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(Error::InvalidAddress(format!("domain too long: {}", domain)));
            }
            request.push(ATYP_DOMAIN);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    // 4. Reply
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Error::Tunnel("Invalid SOCKS version in relay reply".into()));
    }
    if reply[1] != REP_SUCCESS {
        return Err(Error::Tunnel(format!(
            "Relay refused {}: {}",
            target,
            reply_message(reply[1])
        )));
    }

    // Skip bound address
    match reply[3] {
        ATYP_IPV4 => {
            let mut skip = [0u8; 6];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut skip = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_IPV6 => {
            let mut skip = [0u8; 18];
            stream.read_exact(&mut skip).await?;
        }
        other => {
            return Err(Error::Tunnel(format!("Unknown address type in relay reply: {}", other)));
        }
    }

    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

async fn http_handshake<S>(
    stream: &mut S,
    target: &Address,
    credentials: Option<&Credentials>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = target.to_string();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

    if let Some(creds) = credentials {
        let encoded = BASE64.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    // Read byte-wise up to the end of the head so no tunneled data is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Tunnel("Relay response head too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&head)
        .map_err(|e| Error::Tunnel(format!("Invalid relay response: {}", e)))?;

    match response.code {
        Some(200) => Ok(()),
        Some(code) => Err(Error::Tunnel(format!(
            "Relay CONNECT to {} failed: {} {}",
            target,
            code,
            response.reason.unwrap_or("")
        ))),
        None => Err(Error::Tunnel("Relay response without status".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn creds() -> Credentials {
        Credentials {
            username: "user".into(),
            password: "pass".into(),
        }
    }

    #[tokio::test]
    async fn test_socks5_handshake_with_auth() {
        let (mut client, mut relay) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            relay.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, AUTH_PASSWORD]);
            relay.write_all(&[5, AUTH_PASSWORD]).await.unwrap();

            let mut auth = [0u8; 11];
            relay.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            relay.write_all(&[1, 0]).await.unwrap();

            let mut request = [0u8; 5 + 11 + 2];
            relay.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[5, CMD_CONNECT, 0, ATYP_DOMAIN, 11]);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &443u16.to_be_bytes());

            relay
                .write_all(&[5, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = Address::domain("example.com", 443);
        socks5_handshake(&mut client, &target, Some(&creds()))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_handshake_refused() {
        let (mut client, mut relay) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            relay.read_exact(&mut greeting).await.unwrap();
            relay.write_all(&[5, AUTH_NONE]).await.unwrap();
            let mut request = [0u8; 10];
            relay.read_exact(&mut request).await.unwrap();
            relay
                .write_all(&[5, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = Address::parse("10.0.0.1:80").unwrap();
        let err = socks5_handshake(&mut client, &target, None).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_http_handshake_keeps_tunneled_bytes() {
        let (mut client, mut relay) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = relay.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            relay
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            request
        });

        let target = Address::domain("example.com", 443);
        http_handshake(&mut client, &target, Some(&creds()))
            .await
            .unwrap();

        let mut rest = [0u8; 5];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_handshake_rejected() {
        let (mut client, mut relay) = duplex(1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = relay.read(&mut buf).await.unwrap();
            relay
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let target = Address::domain("example.com", 443);
        let err = http_handshake(&mut client, &target, None).await.unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_connect_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel = UpstreamTunnel::new(
            Address::from(listener.local_addr().unwrap()),
            UpstreamProtocol::Socks5,
            Duration::from_secs(5),
        );

        tunnel.close().await;
        tunnel.close().await;

        let result = tunnel.connect(&Address::domain("example.com", 80)).await;
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_stalled_tls_relay_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        // Accept, then never answer the ClientHello
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let tls = TlsConfig {
            server_name: Some("relay.example".into()),
            allow_insecure: true,
        };
        let tunnel = UpstreamTunnel::new(
            Address::from(relay_addr),
            UpstreamProtocol::Socks5,
            Duration::from_secs(1),
        )
        .with_tls(&tls)
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tunnel.connect(&Address::domain("example.com", 443)),
        )
        .await
        .expect("connect_timeout should bound the TLS handshake");
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_connect_through_socks5_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[5, AUTH_NONE]).await.unwrap();
            let mut request = [0u8; 10];
            sock.read_exact(&mut request).await.unwrap();
            sock.write_all(&[5, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let tunnel = UpstreamTunnel::new(
            Address::from(relay_addr),
            UpstreamProtocol::Socks5,
            Duration::from_secs(5),
        );
        let mut stream = tunnel
            .connect(&Address::parse("192.0.2.1:80").unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
