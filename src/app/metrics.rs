//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! Exposed via the optional /metrics endpoint (see `stats_api`).

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Connections accepted per protocol
    pub static ref CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("twinproxy_connections_total", "Total connections accepted per protocol"),
        &["protocol"]
    ).unwrap();

    /// Connections currently relaying
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "twinproxy_connections_active",
        "Number of connections currently relaying"
    ).unwrap();

    /// Connections that never reached the relay stage
    pub static ref CONNECTIONS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("twinproxy_connections_failed_total", "Connections aborted before relay, per reason"),
        &["reason"]
    ).unwrap();

    /// Routing decisions (tunnel, direct, rejected)
    pub static ref ROUTE_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("twinproxy_route_decisions_total", "Routing decisions per route"),
        &["route"]
    ).unwrap();

    /// Relayed bytes per direction (upload, download)
    pub static ref RELAY_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("twinproxy_relay_bytes_total", "Bytes relayed per direction"),
        &["direction"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(ROUTE_DECISIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAY_BYTES_TOTAL.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
