//! Routing policy
//!
//! A `Policy` answers one question: should traffic to this host go through
//! the tunnel? `Blocklist` is the bundled implementation, backed by a text
//! list of domains and CIDRs loaded once at startup.

mod matcher;

pub use matcher::{CidrEntry, DomainEntry};

use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use matcher::{parse_line, Entry};

/// Default cache size for host lookups
const DEFAULT_CACHE_SIZE: usize = 4096;

/// Locations searched by `Blocklist::load_default`
const DEFAULT_PATHS: [&str; 3] = [
    "blocklist.txt",
    "/etc/twinproxy/blocklist.txt",
    "/usr/local/etc/twinproxy/blocklist.txt",
];

/// Routing predicate contract
pub trait Policy: Send + Sync {
    /// Whether `host` is listed. A trailing `:port` is ignored.
    fn check(&self, host: &str) -> bool;
}

/// Domain/CIDR blocklist with an LRU result cache
pub struct Blocklist {
    domains: Vec<DomainEntry>,
    cidrs: Vec<CidrEntry>,
    cache: Mutex<LruCache<String, bool>>,
}

impl Blocklist {
    /// An empty list; every check returns false
    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), Vec::new())
    }

    fn from_entries(domains: Vec<DomainEntry>, cidrs: Vec<CidrEntry>) -> Self {
        let size = NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            domains,
            cidrs,
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    /// Parse the text list format
    pub fn parse(content: &str) -> Result<Self> {
        let mut domains = Vec::new();
        let mut cidrs = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            match parse_line(line) {
                Ok(Some(Entry::Domain(d))) => domains.push(d),
                Ok(Some(Entry::Cidr(c))) => cidrs.push(c),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::Config(format!("blocklist line {}: {}", lineno + 1, e)));
                }
            }
        }

        Ok(Self::from_entries(domains, cidrs))
    }

    /// Load from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read blocklist {}: {}", path.display(), e))
        })?;
        let list = Self::parse(&content)?;
        info!(
            "Loaded blocklist from {} ({} domains, {} cidrs)",
            path.display(),
            list.domains.len(),
            list.cidrs.len()
        );
        Ok(list)
    }

    /// Load from the first readable default location
    pub fn load_default() -> Result<Self> {
        for path in DEFAULT_PATHS {
            if Path::new(path).exists() {
                match Self::load(path) {
                    Ok(list) => return Ok(list),
                    Err(e) => warn!("Failed to load blocklist from {}: {}", path, e),
                }
            }
        }

        Err(Error::Config(format!(
            "No blocklist found (searched {})",
            DEFAULT_PATHS.join(", ")
        )))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.domains.len() + self.cidrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, host: &str) -> bool {
        match host.parse::<IpAddr>() {
            Ok(ip) => self.cidrs.iter().any(|c| c.contains(ip)),
            Err(_) => self.domains.iter().any(|d| d.matches(host)),
        }
    }
}

impl Policy for Blocklist {
    fn check(&self, host: &str) -> bool {
        let host = strip_port(host).to_lowercase();

        if let Some(hit) = self.cache.lock().get(&host) {
            return *hit;
        }

        let hit = self.lookup(&host);
        debug!("Policy lookup {} -> {}", host, hit);
        self.cache.lock().put(host, hit);
        hit
    }
}

/// Strip a trailing `:port` and IPv6 brackets
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // More than one ':' without brackets is a bare IPv6 literal
        Some((h, port)) if !h.contains(':') && port.parse::<u16>().is_ok() => h,
        _ => host,
    }
}
