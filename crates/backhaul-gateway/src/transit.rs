//! Per-request correlation record and its single-use response slot.
//!
//! A `RequestTransit` exists for exactly as long as one forwarded request
//! is in flight: created when the request is dispatched, claimed when the
//! agent's ephemeral connection presents the matching identifier, and gone
//! once the response (or an error) has been pushed into the slot. The slot
//! is a oneshot channel, so a second delivery is unrepresentable.

use axum::extract::ws::{Message, WebSocket};
use backhaul_proto::codec;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TunnelError;

/// Outcome pushed into the response slot.
pub type TransitOutcome = Result<http::Response<Bytes>, TunnelError>;

/// One in-flight request: the captured payload plus the slot its response
/// will be delivered through.
pub struct RequestTransit {
    id: String,
    request: http::Request<Bytes>,
    response_tx: oneshot::Sender<TransitOutcome>,
}

impl RequestTransit {
    /// Create a transit for a captured request, returning the receiving
    /// half of the response slot to the dispatcher.
    pub fn new(
        id: String,
        request: http::Request<Bytes>,
    ) -> (Self, oneshot::Receiver<TransitOutcome>) {
        let (response_tx, response_rx) = oneshot::channel();
        (
            Self {
                id,
                request,
                response_tx,
            },
            response_rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write the full captured request onto the ephemeral connection as a
    /// single binary message. This is the gateway-to-agent payload leg.
    pub async fn transit(&self, socket: &mut WebSocket) -> Result<(), TunnelError> {
        let frame = codec::encode_request(&self.request);
        debug!(request_id = %self.id, bytes = frame.len(), "writing request payload");
        socket
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Read one message from the ephemeral connection, decode it as the
    /// response, and fulfill the slot. A read or decode failure fulfills
    /// the slot with the error instead, so the waiting caller never hangs.
    pub async fn deliver(self, socket: &mut WebSocket) -> Result<(), TunnelError> {
        match Self::read_response(socket).await {
            Ok(response) => {
                debug!(request_id = %self.id, status = response.status().as_u16(), "response delivered");
                self.respond(Ok(response));
                Ok(())
            }
            Err(err) => {
                self.respond(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Fulfill the response slot. The receiver may already be gone (the
    /// dispatcher timed out and discarded the transit); that is not an
    /// error here.
    pub fn respond(self, outcome: TransitOutcome) {
        let _ = self.response_tx.send(outcome);
    }

    async fn read_response(
        socket: &mut WebSocket,
    ) -> Result<http::Response<Bytes>, TunnelError> {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Binary(data))) => {
                    return codec::decode_response(&data)
                        .map_err(|e| TunnelError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(TunnelError::Protocol(
                        "expected a binary response frame".to_string(),
                    ));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TunnelError::Transport(
                        "ephemeral connection closed before the response arrived".to_string(),
                    ));
                }
                Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured_request() -> http::Request<Bytes> {
        http::Request::builder()
            .method("GET")
            .uri("/proxies/a/status")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_respond_fulfills_slot_once() {
        let (transit, rx) = RequestTransit::new("id-1".to_string(), captured_request());
        assert_eq!(transit.id(), "id-1");

        let response = http::Response::builder()
            .status(200)
            .body(Bytes::from_static(b"ok"))
            .unwrap();
        transit.respond(Ok(response));

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.status(), 200);
    }

    #[tokio::test]
    async fn test_dropped_transit_unblocks_waiter() {
        let (transit, rx) = RequestTransit::new("id-2".to_string(), captured_request());
        drop(transit);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_respond_after_waiter_gone_is_harmless() {
        let (transit, rx) = RequestTransit::new("id-3".to_string(), captured_request());
        drop(rx);
        transit.respond(Err(TunnelError::Timeout));
    }
}
