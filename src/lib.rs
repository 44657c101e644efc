//! twinproxy - dual-protocol forward proxy with policy routing
//!
//! # Architecture (Layered)
//!
//! ```text
//! Acceptor (TcpListener)
//! → Proxy Protocol (HTTP / SOCKS5 handshake)
//! → Router (tunnel | direct | rejected)
//! → Transport (direct TCP | upstream tunnel)
//! → Relay (bidirectional copy)
//! ```
//!
//! A process-wide shutdown `Coordinator` runs orthogonally: long-lived
//! activities register work with it and watch its cancellation token.
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Layers meet at traits (`ProxyProtocol`, `Tunnel`, `Policy`)
//! - Data flows as Stream + Metadata
//! - Routing decisions do no IO
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Metadata, Address, relay
//! ├── shutdown/        # Shutdown coordinator, signal entry
//! ├── policy/          # Routing predicate: domain/CIDR blocklist
//! ├── router/          # Dial policy: tunnel vs direct, fail-closed
//! ├── transport/       # Direct TCP, TLS, upstream tunnel
//! ├── protocol/        # Protocol layer: SOCKS5, HTTP
//! └── app/             # Application: Proxy, metrics, relaunch
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod protocol;
pub mod router;
pub mod app;

// Supporting modules
pub mod config;
pub mod policy;
pub mod shutdown;

// Re-exports for convenience
pub use common::{Address, Metadata, Route, Stream};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::Proxy;
pub use policy::Policy;
pub use protocol::ProxyProtocol;
pub use router::Dialer;
pub use shutdown::Coordinator;
pub use transport::Tunnel;
