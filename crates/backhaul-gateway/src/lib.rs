//! Gateway side of the backhaul reverse tunnel.
//!
//! The gateway is the publicly reachable half of the system. Agents dial in
//! and hold a long-lived control connection; external callers send ordinary
//! HTTP requests to `/proxies/{agent}/...`, which the gateway forwards to
//! the matching agent and answers with the agent's response. The control
//! connection only ever carries keepalive frames and request identifiers;
//! each request's payload travels over a per-request ephemeral connection
//! the agent opens back to `/agents/{agent}/response`.

pub mod auth;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod transit;
pub mod tunnel;

pub use auth::{AllowAll, Authenticate, BearerToken};
pub use config::GatewayConfig;
pub use error::{StatusError, TunnelError};
pub use registry::TunnelRegistry;
pub use server::{router, AppState};
pub use transit::RequestTransit;
pub use tunnel::Tunnel;
