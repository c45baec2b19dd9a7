//! Gateway configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the HTTP control surface listens on.
    pub bind_addr: SocketAddr,

    /// How long a forwarded request may wait for the agent's response
    /// before the caller gets a timeout error and the transit is discarded.
    pub forward_timeout: Duration,

    /// Liveness window for control-connection keepalive.
    pub keepalive_window: Duration,

    /// Largest request body the gateway will capture for forwarding.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9991)),
            forward_timeout: Duration::from_secs(30),
            keepalive_window: backhaul_proto::DEFAULT_KEEPALIVE_WINDOW,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}
