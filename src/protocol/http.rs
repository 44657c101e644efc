//! HTTP forward proxy implementation (CONNECT and plain requests)

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{spawn_relay, Metadata, RelayHandle, Result, Stream};
use crate::error::Error;
use crate::router::Dialer;

use super::{open_upstream, relay_label, ProxyProtocol};

/// Upper bound for a request head
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for the number of request headers
const MAX_HEADERS: usize = 96;

const CONNECT_RESPONSE: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

/// HTTP proxy handler
#[derive(Debug, Default)]
pub struct HttpProtocol;

/// Parsed request head
#[derive(Debug, Clone)]
struct RequestHead {
    method: String,
    target: String,
    /// Minor HTTP version (0 or 1)
    version: u8,
    headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Read one request head from `client`.
///
/// Returns the head and any bytes read past it.
async fn read_request_head(client: &mut Stream) -> Result<(RequestHead, Vec<u8>)> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if client.read_buf(&mut buf).await? == 0 {
            return Err(Error::Protocol(if buf.is_empty() {
                "Client closed before sending a request".into()
            } else {
                "Truncated HTTP request".into()
            }));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let head = RequestHead {
                    method: request.method.unwrap_or_default().to_string(),
                    target: request.path.unwrap_or_default().to_string(),
                    version: request.version.unwrap_or(1),
                    headers: request
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), h.value.to_vec()))
                        .collect(),
                };
                return Ok((head, buf[head_len..].to_vec()));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(Error::Protocol("HTTP request head too large".into()));
                }
            }
            Err(e) => return Err(Error::Protocol(format!("Malformed HTTP request: {}", e))),
        }
    }
}

/// Split an absolute-form target into (authority, origin-form path).
///
/// `https` targets without an explicit port get 443.
fn split_absolute_target(target: &str) -> Option<(String, String)> {
    let (scheme, rest) = target.split_once("://")?;
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else if scheme.eq_ignore_ascii_case("http") {
        None
    } else {
        return None;
    };

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return None;
    }

    let path = match &rest[end..] {
        "" => "/".to_string(),
        p if p.starts_with('/') => p.to_string(),
        p => format!("/{}", p),
    };

    let has_port = authority
        .rsplit_once(':')
        .map(|(h, _)| !h.ends_with(':') && (!h.contains(':') || h.ends_with(']')))
        .unwrap_or(false);
    let authority = match default_port {
        Some(port) if !has_port => format!("{}:{}", authority, port),
        _ => authority.to_string(),
    };

    Some((authority, path))
}

/// Resolve the destination authority and the path to send upstream
fn resolve_target(head: &RequestHead) -> Result<(String, String)> {
    if let Some(split) = split_absolute_target(&head.target) {
        return Ok(split);
    }

    if !head.target.starts_with('/') && head.target != "*" {
        return Err(Error::Protocol(format!("Invalid request target: {}", head.target)));
    }

    let host = head
        .header("host")
        .and_then(|h| std::str::from_utf8(h).ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Protocol("Request without Host header".into()))?;

    Ok((host.to_string(), head.target.clone()))
}

/// Encode a request for the upstream leg.
///
/// Hop-by-hop proxy headers are dropped, `Host` is set to `authority` and the
/// upstream connection is forced to close after one response.
fn encode_forward_request(head: &RequestHead, path: &str, authority: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\nHost: {}\r\n", head.method, path, head.version, authority)
            .as_bytes(),
    );

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

#[async_trait]
impl ProxyProtocol for HttpProtocol {
    async fn serve(
        &self,
        mut client: Stream,
        metadata: &mut Metadata,
        dialer: &Dialer,
    ) -> Result<RelayHandle> {
        let (head, leftover) = read_request_head(&mut client).await?;

        if head.is_connect() {
            let mut upstream = open_upstream(dialer, &head.target, metadata).await?;

            client.write_all(CONNECT_RESPONSE).await?;
            client.flush().await?;

            // Bytes the client pipelined after the CONNECT head
            if !leftover.is_empty() {
                upstream.write_all(&leftover).await?;
            }

            return Ok(spawn_relay(client, upstream, relay_label(metadata)));
        }

        let (authority, path) = resolve_target(&head)?;
        let mut upstream = open_upstream(dialer, &authority, metadata).await?;

        let mut request = encode_forward_request(&head, &path, &authority);
        request.extend_from_slice(&leftover);
        upstream.write_all(&request).await?;
        upstream.flush().await?;

        Ok(spawn_relay(client, upstream, relay_label(metadata)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{direct_dialer, echo_server, metadata};
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn spawn_serve(server: tokio::io::DuplexStream) -> tokio::task::JoinHandle<Result<RelayHandle>> {
        tokio::spawn(async move {
            let mut metadata = metadata("http");
            let dialer = direct_dialer();
            HttpProtocol.serve(Box::new(server), &mut metadata, &dialer).await
        })
    }

    fn head(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.into(),
            target: target.into(),
            version: 1,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.as_bytes().to_vec()))
                .collect(),
        }
    }

    #[test]
    fn test_split_absolute_target() {
        assert_eq!(
            split_absolute_target("http://example.com/a?b=1"),
            Some(("example.com".into(), "/a?b=1".into()))
        );
        assert_eq!(
            split_absolute_target("http://example.com:8080"),
            Some(("example.com:8080".into(), "/".into()))
        );
        assert_eq!(
            split_absolute_target("https://example.com/x"),
            Some(("example.com:443".into(), "/x".into()))
        );
        assert_eq!(
            split_absolute_target("http://user:pw@example.com/"),
            Some(("example.com".into(), "/".into()))
        );
        assert_eq!(split_absolute_target("/index.html"), None);
        assert_eq!(split_absolute_target("ftp://example.com/"), None);
    }

    #[test]
    fn test_resolve_origin_form_uses_host() {
        let h = head("GET", "/x", &[("Host", "example.com:81")]);
        assert_eq!(
            resolve_target(&h).unwrap(),
            ("example.com:81".to_string(), "/x".to_string())
        );

        let h = head("GET", "/x", &[]);
        assert!(matches!(resolve_target(&h), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_encode_forward_request_strips_proxy_headers() {
        let h = head(
            "GET",
            "http://example.com/index.html",
            &[
                ("Host", "example.com"),
                ("Proxy-Connection", "keep-alive"),
                ("Connection", "keep-alive"),
                ("Accept", "*/*"),
            ],
        );
        let out = encode_forward_request(&h, "/index.html", "example.com");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "GET /index.html HTTP/1.1\r\n\
             Host: example.com\r\n\
             Accept: */*\r\n\
             Connection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_connect_replies_and_relays() {
        let target = echo_server().await;
        let (mut client, server) = duplex(4096);
        let task = spawn_serve(server);

        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\nearly", target).as_bytes())
            .await
            .unwrap();

        let mut response = vec![0u8; CONNECT_RESPONSE.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, CONNECT_RESPONSE);

        let _relay = task.await.unwrap().unwrap();

        // Pipelined bytes reached the target and came back
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");

        client.write_all(b"more").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"more");
    }

    #[tokio::test]
    async fn test_plain_request_is_rewritten() {
        // Upstream returns the request head it received as the body, then closes
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            sock.write_all(&received).await.unwrap();
        });

        let (mut client, server) = duplex(4096);
        let task = spawn_serve(server);

        client
            .write_all(
                format!(
                    "GET http://{}/index.html HTTP/1.1\r\n\
                     Host: ignored.example\r\n\
                     Proxy-Connection: keep-alive\r\n\
                     Accept: */*\r\n\r\n",
                    target
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let _relay = task.await.unwrap().unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        let echoed = String::from_utf8(echoed).unwrap();

        assert!(echoed.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(echoed.contains(&format!("Host: {}\r\n", target)));
        assert!(echoed.contains("Accept: */*\r\n"));
        assert!(echoed.ends_with("Connection: close\r\n\r\n"));
        assert!(!echoed.contains("Proxy-Connection"));
        assert!(!echoed.contains("ignored.example"));
    }

    #[tokio::test]
    async fn test_malformed_request_closes() {
        let (mut client, server) = duplex(4096);
        let task = spawn_serve(server);

        client.write_all(b"\x01\x02 garbage\r\n\r\n").await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_head_closes() {
        let (client, server) = duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let task = spawn_serve(server);

        // A header value that never terminates
        tokio::spawn(async move {
            let _ = client_write.write_all(b"GET / HTTP/1.1\r\nX-Filler: ").await;
            let chunk = vec![b'a'; 1024];
            for _ in 0..(MAX_HEAD_SIZE / 1024 + 8) {
                if client_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("too large"));

        let mut buf = Vec::new();
        client_read.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_header_count_limit() {
        let request = |count: usize| {
            let mut raw = String::from("GET / HTTP/1.1\r\n");
            for i in 0..count {
                raw.push_str(&format!("X-H{}: v\r\n", i));
            }
            raw.push_str("\r\n");
            raw
        };

        let (mut client, server) = duplex(16 * 1024);
        client.write_all(request(MAX_HEADERS).as_bytes()).await.unwrap();
        let mut server: Stream = Box::new(server);
        let (head, leftover) = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.headers.len(), MAX_HEADERS);
        assert!(leftover.is_empty());

        let (mut client, server) = duplex(16 * 1024);
        client
            .write_all(request(MAX_HEADERS + 1).as_bytes())
            .await
            .unwrap();
        let mut server: Stream = Box::new(server);
        assert!(matches!(
            read_request_head(&mut server).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_dial_failure_closes() {
        // Grab a free port, then close it again
        let target = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let (mut client, server) = duplex(4096);
        let task = spawn_serve(server);

        client
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        assert!(task.await.unwrap().is_err());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
