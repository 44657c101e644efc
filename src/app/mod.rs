//! Application Layer
//!
//! This module contains:
//! - Proxy: listener, acceptor and per-connection handling
//! - Metrics: Prometheus counters shared by every layer
//! - StatsApi: HTTP endpoint exposing the metrics
//! - Relaunch: new process instance on graceful restart

pub mod metrics;
mod proxy;
mod relaunch;
pub mod stats_api;

pub use proxy::Proxy;
pub use relaunch::relaunch;
pub use stats_api::start_api_server;
