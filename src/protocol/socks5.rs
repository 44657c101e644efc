//! SOCKS5 Protocol implementation (no-auth, CONNECT only)

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{spawn_relay, Metadata, RelayHandle, Result, Stream};
use crate::error::Error;
use crate::router::Dialer;

use super::{open_upstream, relay_label, ProxyProtocol};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;

/// Reply sent for every unsupported request (BIND, UDP ASSOCIATE, IPv6, ...)
const FAILURE_REPLY: [u8; 10] = [SOCKS5_VERSION, 0x02, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// SOCKS5 protocol handler
#[derive(Debug, Default)]
pub struct Socks5Protocol;

/// Destination read from a CONNECT request
struct Request {
    atyp: u8,
    /// Address bytes plus port, exactly as received
    payload: Vec<u8>,
    host: String,
    port: u16,
}

impl Request {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Socks5Protocol {
    async fn negotiate(client: &mut Stream) -> Result<()> {
        let mut version = [0u8; 1];
        client.read_exact(&mut version).await?;
        if version[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "Unsupported SOCKS version: {}",
                version[0]
            )));
        }

        // Offered methods are read and ignored; only no-auth is spoken
        let mut nmethods = [0u8; 1];
        client.read_exact(&mut nmethods).await?;
        let mut methods = vec![0u8; nmethods[0] as usize];
        client.read_exact(&mut methods).await?;

        client.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
        Ok(())
    }

    async fn read_request(client: &mut Stream) -> Result<Request> {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in request".into()));
        }

        let cmd = header[1];
        let atyp = header[3];

        if cmd != CMD_CONNECT {
            client.write_all(&FAILURE_REPLY).await?;
            return Err(Error::Protocol(format!("Unsupported command: {}", cmd)));
        }

        let (payload, host) = match atyp {
            ATYP_IPV4 => {
                let mut payload = vec![0u8; 6];
                client.read_exact(&mut payload).await?;
                let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
                (payload, ip.to_string())
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                client.read_exact(&mut len).await?;
                let mut payload = vec![0u8; 1 + len[0] as usize + 2];
                payload[0] = len[0];
                client.read_exact(&mut payload[1..]).await?;
                let domain = std::str::from_utf8(&payload[1..payload.len() - 2])
                    .map_err(|_| Error::Protocol("Domain is not valid UTF-8".into()))?
                    .to_string();
                (payload, domain)
            }
            _ => {
                client.write_all(&FAILURE_REPLY).await?;
                return Err(Error::Protocol(format!(
                    "Unsupported address type: {}",
                    atyp
                )));
            }
        };

        let port = u16::from_be_bytes([payload[payload.len() - 2], payload[payload.len() - 1]]);

        Ok(Request {
            atyp,
            payload,
            host,
            port,
        })
    }
}

#[async_trait]
impl ProxyProtocol for Socks5Protocol {
    async fn serve(
        &self,
        mut client: Stream,
        metadata: &mut Metadata,
        dialer: &Dialer,
    ) -> Result<RelayHandle> {
        Self::negotiate(&mut client).await?;
        let request = Self::read_request(&mut client).await?;

        // Dial failures close the client without a reply
        let upstream = open_upstream(dialer, &request.target(), metadata).await?;

        // The received address payload is echoed back as the bound address
        let mut reply = Vec::with_capacity(4 + request.payload.len());
        reply.extend_from_slice(&[SOCKS5_VERSION, REP_SUCCESS, 0x00, request.atyp]);
        reply.extend_from_slice(&request.payload);
        client.write_all(&reply).await?;
        client.flush().await?;

        Ok(spawn_relay(client, upstream, relay_label(metadata)))
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}
