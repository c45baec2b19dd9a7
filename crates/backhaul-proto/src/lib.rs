//! Wire contracts shared by the backhaul gateway and agent.
//!
//! The control connection carries only keepalive frames and request
//! identifiers; the full HTTP payload for each request travels on a
//! dedicated ephemeral connection as a single serialized message per
//! direction. This crate defines the pieces both sides must agree on:
//!
//! - the header used to correlate an ephemeral connection with its
//!   dispatched request identifier,
//! - keepalive timing derived from a shared liveness window,
//! - the single-message HTTP/1.1 request/response codec,
//! - the `/proxies/{agent}` path rewrite applied on the agent side.

pub mod codec;

use std::time::Duration;

/// Header carrying the request identifier, both on the forwarded request
/// and on the handshake of the ephemeral data-plane connection.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Base liveness window. Pings must arrive well inside this window for a
/// peer to be considered alive.
pub const DEFAULT_KEEPALIVE_WINDOW: Duration = Duration::from_secs(10);

/// Extra slack granted to a ping write on top of the liveness window.
pub const PING_WRITE_MARGIN: Duration = Duration::from_secs(1);

/// Interval at which a peer emits pings: 90% of the liveness window, so a
/// single lost ping still fits inside it.
pub fn ping_period(window: Duration) -> Duration {
    window.mul_f64(0.9)
}

/// Deadline applied to a single ping write.
pub fn ping_write_timeout(window: Duration) -> Duration {
    window + PING_WRITE_MARGIN
}

/// Strip the gateway routing prefix `/proxies/{agent}` from a path so the
/// agent's local target sees its native path.
///
/// Paths that do not carry the prefix are returned unchanged; stripping the
/// bare prefix yields `/`.
pub fn strip_proxy_prefix(path: &str, agent: &str) -> String {
    let prefix = format!("/proxies/{agent}");
    match path.strip_prefix(&prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') || rest.starts_with('?') => rest.to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_proxy_prefix() {
        assert_eq!(strip_proxy_prefix("/proxies/a/x/y", "a"), "/x/y");
        assert_eq!(strip_proxy_prefix("/proxies/a", "a"), "/");
        assert_eq!(strip_proxy_prefix("/proxies/a/", "a"), "/");
        assert_eq!(strip_proxy_prefix("/proxies/a/x?q=1", "a"), "/x?q=1");
    }

    #[test]
    fn test_strip_proxy_prefix_no_op_without_prefix() {
        assert_eq!(strip_proxy_prefix("/x/y", "a"), "/x/y");
        // Stripping twice is a no-op
        let once = strip_proxy_prefix("/proxies/a/x/y", "a");
        assert_eq!(strip_proxy_prefix(&once, "a"), "/x/y");
    }

    #[test]
    fn test_strip_proxy_prefix_requires_exact_agent_segment() {
        // A longer agent name sharing the prefix must not be stripped
        assert_eq!(
            strip_proxy_prefix("/proxies/alpha2/x", "alpha"),
            "/proxies/alpha2/x"
        );
        assert_eq!(strip_proxy_prefix("/proxies/other/x", "a"), "/proxies/other/x");
    }

    #[test]
    fn test_ping_period_fits_window() {
        let window = DEFAULT_KEEPALIVE_WINDOW;
        assert!(ping_period(window) < window);
        assert!(ping_write_timeout(window) > window);
    }
}
