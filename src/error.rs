//! Error types for twinproxy

use thiserror::Error;

/// Main error type for twinproxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Destination rejected by policy: {0}")]
    PolicyRejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Closed")]
    Closed,
}

/// Result type alias for twinproxy
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
            Error::InvalidAddress(_) => "address",
            Error::PolicyRejected(_) => "policy",
            Error::Timeout => "timeout",
            Error::Tunnel(_) => "tunnel",
            Error::Closed => "closed",
        }
    }
}
