//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Client-facing handshake parsing
//! - Target address extraction
//! - Handshake replies
//! - Handing both legs to the relay engine
//!
//! Outbound connections are opened through the router's `Dialer`; this
//! layer never decides between tunnel and direct itself.

mod http;
mod socks5;

pub use http::HttpProtocol;
pub use socks5::Socks5Protocol;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::{Metadata, RelayHandle, Result, Stream};
use crate::router::Dialer;

/// Client-facing proxy protocol
///
/// A handler owns the client stream for the whole handshake. On success the
/// relay is already running and the handler returns without waiting for it;
/// on failure every stream it opened has been dropped.
#[async_trait]
pub trait ProxyProtocol: Send + Sync {
    /// Run the handshake on `client`, dial the destination and start relaying.
    ///
    /// `metadata` is filled in as the destination and route become known.
    async fn serve(
        &self,
        client: Stream,
        metadata: &mut Metadata,
        dialer: &Dialer,
    ) -> Result<RelayHandle>;

    /// Get protocol name
    fn name(&self) -> &'static str;
}

/// Create the handler for the configured mode
pub fn create_protocol(http_mode: bool) -> Box<dyn ProxyProtocol> {
    if http_mode {
        Box::new(HttpProtocol)
    } else {
        Box::new(Socks5Protocol)
    }
}

/// Dial `target` through `dialer`, recording the outcome in `metadata`
async fn open_upstream(dialer: &Dialer, target: &str, metadata: &mut Metadata) -> Result<Stream> {
    info!("[{}] {} {} connecting...", metadata.listener, metadata.protocol, target);

    match dialer.dial(target).await {
        Ok((addr, route, stream)) => {
            info!("[{}] {} via {} connected.", metadata.listener, addr, route);
            metadata.destination = Some(addr);
            metadata.route = Some(route);
            Ok(stream)
        }
        Err(e) => {
            debug!("[{}] {} dial error: {}", metadata.listener, target, e);
            Err(e)
        }
    }
}

/// Relay label for a connection
fn relay_label(metadata: &Metadata) -> String {
    format!("{} {} -> {}", metadata.listener, metadata.source, metadata.target())
}
