//! Address type for network connections

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Port appended to destinations that do not carry one
pub const DEFAULT_PORT: u16 = 80;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Build from a host (IP literal or name) and a port
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Parse a `host:port` authority, appending the default port when none is present.
    ///
    /// A fully bracketed IPv6 literal (`[::1]`) or a string without any `:`
    /// is treated as port-less.
    pub fn from_authority(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty address".into()));
        }

        let bracketed = s.starts_with('[') && s.ends_with(']');
        if bracketed || !s.contains(':') {
            return Self::parse(&format!("{}:{}", s, DEFAULT_PORT));
        }

        Self::parse(s)
    }

    /// Parse a `host:port` string; the port is mandatory
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;

        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {}", s)));
        }

        Ok(Self::from_host_port(host, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
