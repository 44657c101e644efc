//! Router Layer
//!
//! Responsibilities:
//! - Classify a destination as tunnel or direct
//! - Enforce fail-closed routing
//! - Open the outbound leg for a protocol handler
//!
//! Classification (`should_tunnel`, `route_for`) is pure: no IO.
//! Only `dial` touches the network.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::app::metrics::ROUTE_DECISIONS_TOTAL;
use crate::common::{Address, Result, Route, Stream};
use crate::error::Error;
use crate::policy::Policy;
use crate::transport::{connect_direct, Tunnel, DIRECT_DIAL_TIMEOUT};

/// Routing knobs, immutable after construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Tunnel everything; the policy is never consulted
    pub force_tunnel: bool,
    /// Tunnel destinations the policy lists
    pub policy_routing: bool,
    /// With `policy_routing`, reject destinations the policy does not list
    pub fail_closed: bool,
}

/// Routing/dial policy shared by all connections of a proxy
pub struct Dialer {
    config: RoutingConfig,
    policy: Arc<dyn Policy>,
    tunnel: Arc<dyn Tunnel>,
    dial_timeout: Duration,
}

impl Dialer {
    pub fn new(config: RoutingConfig, policy: Arc<dyn Policy>, tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            config,
            policy,
            tunnel,
            dial_timeout: DIRECT_DIAL_TIMEOUT,
        }
    }

    /// Override the direct dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn tunnel(&self) -> &Arc<dyn Tunnel> {
        &self.tunnel
    }

    /// Whether traffic to `host` goes through the tunnel
    pub fn should_tunnel(&self, host: &str) -> bool {
        if self.config.force_tunnel {
            return true;
        }
        if self.config.policy_routing {
            return self.policy.check(host);
        }
        false
    }

    /// Classify `addr`, failing when fail-closed routing rejects it
    pub fn route_for(&self, addr: &Address) -> Result<Route> {
        let route = if self.should_tunnel(&addr.host()) {
            Route::Tunnel
        } else if self.config.policy_routing && self.config.fail_closed {
            ROUTE_DECISIONS_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(Error::PolicyRejected(addr.to_string()));
        } else {
            Route::Direct
        };

        ROUTE_DECISIONS_TOTAL.with_label_values(&[route.as_str()]).inc();
        Ok(route)
    }

    /// Normalize `target`, classify it and open the outbound leg.
    ///
    /// A target without a port gets port 80.
    pub async fn dial(&self, target: &str) -> Result<(Address, Route, Stream)> {
        let addr = Address::from_authority(target)?;
        let route = self.route_for(&addr)?;
        debug!("Route {} -> {}", addr, route);

        let stream = match route {
            Route::Tunnel => self.tunnel.connect(&addr).await?,
            Route::Direct => connect_direct(&addr, self.dial_timeout).await?,
        };

        Ok((addr, route, stream))
    }
}
