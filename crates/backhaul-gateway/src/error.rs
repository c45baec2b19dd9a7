//! Error taxonomy for the gateway.
//!
//! Faults are classified where they surface instead of being inferred from
//! error text later: transport-class faults evict the owning tunnel, while
//! request-scoped faults (timeouts, protocol violations, unknown transits)
//! only resolve the one affected request.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure forwarding a request through a tunnel.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// The request identifier could not be handed to the control channel.
    #[error("control channel dispatch failed: {0}")]
    Dispatch(String),

    /// The tunnel was closed while the request was in flight.
    #[error("tunnel closed")]
    Closed,

    /// The agent never completed the data-plane exchange in time.
    #[error("timed out waiting for the agent response")]
    Timeout,

    /// The underlying connection failed mid-exchange.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No pending transit matches the presented identifier; it is stale,
    /// already claimed, or forged.
    #[error("no transit pending for request {0}")]
    TransitNotFound(String),
}

impl TunnelError {
    /// Whether this fault means the control connection itself is unusable.
    /// Transport-class faults evict the tunnel; the rest are scoped to one
    /// request.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            TunnelError::Dispatch(_) | TunnelError::Transport(_) | TunnelError::Closed
        )
    }
}

/// JSON error body returned to external callers: `{"code": <int>, "msg": <string>}`,
/// with the HTTP status equal to `code`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusError {
    pub code: u16,
    pub msg: String,
}

impl StatusError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            msg: msg.into(),
        }
    }
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<TunnelError> for StatusError {
    fn from(err: TunnelError) -> Self {
        let status = match err {
            TunnelError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TunnelError::Dispatch(_) | TunnelError::Transport(_) | TunnelError::Closed => {
                StatusCode::GONE
            }
            TunnelError::TransitNotFound(_) => StatusCode::CONFLICT,
            TunnelError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        StatusError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_fault_classification() {
        assert!(TunnelError::Closed.is_transport_fault());
        assert!(TunnelError::Transport("reset".into()).is_transport_fault());
        assert!(TunnelError::Dispatch("gone".into()).is_transport_fault());
        assert!(!TunnelError::Timeout.is_transport_fault());
        assert!(!TunnelError::Protocol("bad frame".into()).is_transport_fault());
        assert!(!TunnelError::TransitNotFound("id".into()).is_transport_fault());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(StatusError::from(TunnelError::Timeout).code, 504);
        assert_eq!(StatusError::from(TunnelError::Closed).code, 410);
        assert_eq!(StatusError::from(TunnelError::TransitNotFound("x".into())).code, 409);
        assert_eq!(StatusError::from(TunnelError::Protocol("x".into())).code, 500);
    }

    #[test]
    fn test_status_error_serializes_code_and_msg() {
        let body = serde_json::to_string(&StatusError::new(
            StatusCode::NOT_FOUND,
            "no agent registered as huawei",
        ))
        .unwrap();
        assert_eq!(
            body,
            r#"{"code":404,"msg":"no agent registered as huawei"}"#
        );
    }
}
