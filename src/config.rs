//! Configuration module for twinproxy
//!
//! JSON configuration with defaults for every section. `Config::validate`
//! runs after parsing; the builders below turn sections into runtime
//! objects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::Address;
use crate::error::{Error, Result};
use crate::policy::{Blocklist, Policy};
use crate::router::RoutingConfig;
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::transport::{
    DisabledTunnel, TlsConfig, Tunnel, UpstreamProtocol, UpstreamTunnel, DIRECT_DIAL_TIMEOUT,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Listener and routing knobs
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Upstream relay; required when anything is tunneled
    #[serde(default)]
    pub tunnel: Option<TunnelSettings>,

    /// Routing predicate source
    #[serde(default)]
    pub policy: PolicySettings,

    /// Graceful shutdown
    #[serde(default)]
    pub shutdown: ShutdownSettings,

    /// API configuration
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Proxy listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// `host:port`, `:port` or a bare port
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Speak HTTP proxy instead of SOCKS5
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub force_tunnel: bool,
    #[serde(default)]
    pub policy_routing: bool,
    #[serde(default)]
    pub fail_closed: bool,
}

fn default_bind() -> String {
    "1080".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http: false,
            force_tunnel: false,
            policy_routing: false,
            fail_closed: false,
        }
    }
}

impl ProxySettings {
    /// Bind address with bare ports expanded to all interfaces
    pub fn bind_addr(&self) -> Result<String> {
        let bind = self.bind.trim();
        if bind.is_empty() {
            return Err(Error::Config("proxy.bind must not be empty".into()));
        }

        if bind.starts_with(':') {
            Ok(format!("0.0.0.0{}", bind))
        } else if !bind.contains(':') {
            Ok(format!("0.0.0.0:{}", bind))
        } else {
            Ok(bind.to_string())
        }
    }

    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            force_tunnel: self.force_tunnel,
            policy_routing: self.policy_routing,
            fail_closed: self.fail_closed,
        }
    }
}

/// Relay protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Socks5,
    Http,
}

/// Upstream relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Relay `host:port`
    pub server: String,
    #[serde(default)]
    pub protocol: TunnelProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Wrap relay connections in TLS when present
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    DIRECT_DIAL_TIMEOUT.as_secs()
}

/// TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Server name for SNI
    #[serde(default)]
    pub server_name: Option<String>,
    /// Allow insecure certificates
    #[serde(default)]
    pub allow_insecure: bool,
}

impl TunnelSettings {
    /// Build the upstream tunnel
    pub fn build(&self) -> Result<UpstreamTunnel> {
        let server = Address::parse(&self.server)
            .map_err(|e| Error::Config(format!("tunnel.server: {}", e)))?;
        let protocol = match self.protocol {
            TunnelProtocol::Socks5 => UpstreamProtocol::Socks5,
            TunnelProtocol::Http => UpstreamProtocol::Http,
        };

        let mut tunnel = UpstreamTunnel::new(
            server,
            protocol,
            Duration::from_secs(self.connect_timeout_secs),
        );

        match (&self.username, &self.password) {
            (Some(user), password) => {
                tunnel = tunnel.with_credentials(user.as_str(), password.as_deref().unwrap_or(""));
            }
            (None, Some(_)) => {
                return Err(Error::Config("tunnel.password set without tunnel.username".into()));
            }
            (None, None) => {}
        }

        if let Some(tls) = &self.tls {
            tunnel = tunnel.with_tls(&TlsConfig {
                server_name: tls.server_name.clone(),
                allow_insecure: tls.allow_insecure,
            })?;
        }

        Ok(tunnel)
    }
}

/// Routing predicate source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Blocklist path; default locations are searched when absent
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Graceful shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// Drain budget in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
    /// Lifecycle is owned by a host; restart signals only stop
    #[serde(default)]
    pub host_managed: bool,
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_secs()
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
            host_managed: false,
        }
    }
}

impl ShutdownSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the metrics API (e.g., "127.0.0.1:9090")
    pub listen: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section constraints
    pub fn validate(&self) -> Result<()> {
        self.proxy.bind_addr()?;

        let tunneled = self.proxy.force_tunnel || self.proxy.policy_routing;
        match &self.tunnel {
            None if tunneled => {
                return Err(Error::Config(
                    "force_tunnel/policy_routing require a tunnel section".into(),
                ));
            }
            Some(tunnel) => {
                Address::parse(&tunnel.server)
                    .map_err(|e| Error::Config(format!("tunnel.server: {}", e)))?;
                if tunnel.connect_timeout_secs == 0 {
                    return Err(Error::Config("tunnel.connect_timeout_secs must be > 0".into()));
                }
            }
            None => {}
        }

        if self.shutdown.timeout_secs == 0 {
            return Err(Error::Config("shutdown.timeout_secs must be > 0".into()));
        }

        Ok(())
    }

    /// Build the tunnel transport; a disabled tunnel when none is configured
    pub fn build_tunnel(&self) -> Result<Arc<dyn Tunnel>> {
        match &self.tunnel {
            Some(tunnel) => Ok(Arc::new(tunnel.build()?)),
            None => Ok(Arc::new(DisabledTunnel)),
        }
    }

    /// Load the routing predicate. Only read from disk with policy routing on.
    pub fn load_policy(&self) -> Result<Arc<dyn Policy>> {
        if !self.proxy.policy_routing {
            return Ok(Arc::new(Blocklist::empty()));
        }

        let list = match &self.policy.file {
            Some(path) => Blocklist::load(path)?,
            None => Blocklist::load_default()?,
        };
        Ok(Arc::new(list))
    }

    /// Sample configuration printed by `--gen-config`
    pub fn sample() -> Self {
        Config {
            log: LogConfig::default(),
            proxy: ProxySettings {
                bind: "1080".to_string(),
                http: false,
                force_tunnel: false,
                policy_routing: true,
                fail_closed: false,
            },
            tunnel: Some(TunnelSettings {
                server: "relay.example.com:443".to_string(),
                protocol: TunnelProtocol::Socks5,
                username: None,
                password: None,
                tls: Some(TlsSettings {
                    server_name: Some("relay.example.com".to_string()),
                    allow_insecure: false,
                }),
                connect_timeout_secs: default_connect_timeout(),
            }),
            policy: PolicySettings {
                file: Some(PathBuf::from("blocklist.txt")),
            },
            shutdown: ShutdownSettings::default(),
            api: Some(ApiConfig {
                listen: "127.0.0.1:9090".to_string(),
            }),
        }
    }
}
