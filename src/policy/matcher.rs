//! Entry types of the routing blocklist

use std::net::IpAddr;

use regex::Regex;

use crate::error::{Error, Result};

/// Domain entry with match type
#[derive(Debug, Clone)]
pub enum DomainEntry {
    /// Domain suffix match (domain and subdomains)
    Domain(String),
    /// Full domain match
    Full(String),
    /// Keyword match
    Keyword(String),
    /// Regex match
    Regex(Regex),
}

impl DomainEntry {
    /// Check if a lowercase domain matches this entry
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainEntry::Domain(s) => {
                domain == s
                    || (domain.len() > s.len()
                        && domain.ends_with(s.as_str())
                        && domain.as_bytes()[domain.len() - s.len() - 1] == b'.')
            }
            DomainEntry::Full(s) => domain == s,
            DomainEntry::Keyword(s) => domain.contains(s.as_str()),
            DomainEntry::Regex(re) => re.is_match(domain),
        }
    }
}

/// CIDR entry for IP matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrEntry {
    ip: IpAddr,
    prefix: u8,
}

impl CidrEntry {
    /// Parse `a.b.c.d/nn`, `x::/nn`, or a bare IP (host route)
    pub fn parse(s: &str) -> Result<Self> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };

        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid CIDR address: {}", s)))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| Error::Config(format!("Invalid CIDR prefix: {}", s)))?,
            None => max,
        };

        Ok(Self { ip, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false, // IPv4 vs IPv6 mismatch
        }
    }
}

/// One parsed blocklist line
#[derive(Debug, Clone)]
pub enum Entry {
    Domain(DomainEntry),
    Cidr(CidrEntry),
}

/// Parse one line of the blocklist format.
///
/// Returns `Ok(None)` for blank lines and `#` comments.
pub fn parse_line(line: &str) -> Result<Option<Entry>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let entry = if let Some(domain) = line.strip_prefix("full:") {
        Entry::Domain(DomainEntry::Full(domain.to_lowercase()))
    } else if let Some(domain) = line.strip_prefix("domain:") {
        Entry::Domain(DomainEntry::Domain(domain.to_lowercase()))
    } else if let Some(keyword) = line.strip_prefix("keyword:") {
        Entry::Domain(DomainEntry::Keyword(keyword.to_lowercase()))
    } else if let Some(pattern) = line.strip_prefix("regexp:") {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("Invalid regexp {}: {}", pattern, e)))?;
        Entry::Domain(DomainEntry::Regex(re))
    } else if let Some(cidr) = line.strip_prefix("cidr:") {
        Entry::Cidr(CidrEntry::parse(cidr)?)
    } else if let Ok(cidr) = CidrEntry::parse(line) {
        Entry::Cidr(cidr)
    } else {
        // Default to domain match
        Entry::Domain(DomainEntry::Domain(line.trim_start_matches('.').to_lowercase()))
    };

    Ok(Some(entry))
}
