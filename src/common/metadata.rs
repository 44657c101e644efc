//! Metadata - per-connection context shared by handlers, router and relay

use std::net::SocketAddr;

use super::Address;

/// Outbound classification of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Relay through the tunnel transport
    Tunnel,
    /// Dial the destination directly
    Direct,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Tunnel => "tunnel",
            Route::Direct => "direct",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context of one accepted client connection.
///
/// Created by the acceptor, completed by the protocol handler once the
/// destination is known. Owned by the handling task, never shared.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Peer address of the client
    pub source: SocketAddr,
    /// Local listener address (used as the log tag)
    pub listener: SocketAddr,
    /// Destination requested by the client
    pub destination: Option<Address>,
    /// Outbound classification, once decided
    pub route: Option<Route>,
    /// Protocol name (http, socks5)
    pub protocol: &'static str,
}

impl Metadata {
    pub fn new(listener: SocketAddr, source: SocketAddr) -> Self {
        Self {
            source,
            listener,
            destination: None,
            route: None,
            protocol: "",
        }
    }

    /// Builder: set protocol name
    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = protocol;
        self
    }

    /// Destination rendered for logs
    pub fn target(&self) -> String {
        self.destination
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
