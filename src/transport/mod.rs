//! Transport Layer
//!
//! Responsibilities:
//! - Establish outbound connections, either directly or through a tunnel
//! - Bind the client-facing listener
//!
//! NO proxy-protocol parsing and NO routing decisions happen here.

mod null;
mod tcp;
mod tls;
mod upstream;

pub use null::DisabledTunnel;
pub use tcp::{bind_listener, connect_direct, DIRECT_DIAL_TIMEOUT};
pub use tls::{TlsConfig, TlsWrapper};
pub use upstream::{UpstreamProtocol, UpstreamTunnel};

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Secure-channel transport used to reach destinations indirectly.
///
/// Connection timeouts are the tunnel's own responsibility.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Open a connection to `addr` through the tunnel
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    /// Release all transport resources; later connects fail
    async fn close(&self);

    /// Tunnel name for logs
    fn name(&self) -> &'static str;
}
