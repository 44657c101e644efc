//! Common types and abstractions
//!
//! - Stream: unified async I/O abstraction
//! - Metadata: per-connection context
//! - Address: network address representation
//! - relay: bidirectional copy engine

mod address;
mod metadata;
pub mod relay;
mod stream;

pub use address::{Address, DEFAULT_PORT};
pub use metadata::{Metadata, Route};
pub use relay::{spawn_relay, RelayHandle};
pub use stream::{AsyncReadWrite, IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
