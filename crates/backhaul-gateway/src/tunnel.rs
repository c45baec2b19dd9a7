//! One registered agent's control connection and its outstanding requests.
//!
//! A `Tunnel` owns the gateway side of an agent's control connection. The
//! connection itself is driven by three loops: a writer task that is the
//! only place the socket is written (and where write deadlines are
//! enforced), a keepalive loop that feeds it pings, and a receive loop
//! that watches for the peer going away. All of them stop when the
//! tunnel's lifecycle token fires, and the token fires exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use backhaul_proto::{ping_period, ping_write_timeout, REQUEST_ID_HEADER};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TunnelError;
use crate::registry::TunnelRegistry;
use crate::transit::RequestTransit;

/// Gateway-side representation of one registered agent.
pub struct Tunnel {
    name: String,
    /// Distinguishes this registration from a superseded or superseding
    /// one under the same name.
    instance: String,
    control_tx: mpsc::Sender<Message>,
    pending: DashMap<String, RequestTransit>,
    registry: TunnelRegistry,
    lifecycle: CancellationToken,
    closed: AtomicBool,
}

impl Tunnel {
    /// Create a tunnel whose outbound control frames flow through
    /// `control_tx` into a writer task (see [`Tunnel::run_writer`]).
    pub fn new(
        name: String,
        control_tx: mpsc::Sender<Message>,
        registry: TunnelRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            instance: Uuid::new_v4().to_string(),
            control_tx,
            pending: DashMap::new(),
            registry,
            lifecycle: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently waiting for their response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forward a captured request to the agent and wait for its response.
    ///
    /// Only the generated request identifier crosses the control
    /// connection; the payload is fetched by the agent over an ephemeral
    /// connection correlated by that identifier. The wait is bounded by
    /// `timeout`; on expiry the transit is discarded and the caller gets a
    /// timeout error.
    pub async fn forward(
        &self,
        mut request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, TunnelError> {
        let id = Uuid::new_v4().to_string();
        let header = http::HeaderValue::from_str(&id)
            .map_err(|_| TunnelError::Dispatch("unusable request id".to_string()))?;
        request.headers_mut().insert(REQUEST_ID_HEADER, header);

        let (transit, response_rx) = RequestTransit::new(id.clone(), request);
        self.pending.insert(id.clone(), transit);
        debug!(
            agent = %self.name,
            request_id = %id,
            pending = self.pending.len(),
            "dispatching request"
        );

        if let Err(e) = self.control_tx.send(Message::Text(id.clone().into())).await {
            self.discard(&id);
            return Err(TunnelError::Dispatch(format!(
                "control connection is gone: {e}"
            )));
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Slot sender dropped without a value; the tunnel is being
                // torn down.
                self.discard(&id);
                Err(TunnelError::Closed)
            }
            Err(_) => {
                self.discard(&id);
                warn!(agent = %self.name, request_id = %id, "forward timed out");
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Claim the transit for `id`, removing it from the pending set. A
    /// second claim for the same identifier fails, which is what makes
    /// delivery at-most-once.
    pub fn take_transit(&self, id: &str) -> Result<RequestTransit, TunnelError> {
        self.pending
            .remove(id)
            .map(|(_, transit)| transit)
            .ok_or_else(|| TunnelError::TransitNotFound(id.to_string()))
    }

    /// Drop the pending entry for `id`, if any.
    pub fn discard(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Tear the tunnel down. Runs its body exactly once: deregisters this
    /// instance, fires the lifecycle token so every loop exits, and fails
    /// all pending transits so no caller stays blocked.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(agent = %self.name, pending = self.pending.len(), "closing tunnel");

        // A superseded tunnel must not evict its replacement, so removal
        // is keyed on the instance id as well as the name.
        self.registry.remove(&self.name, &self.instance);
        self.lifecycle.cancel();

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, transit)) = self.pending.remove(&id) {
                transit.respond(Err(TunnelError::Closed));
            }
        }
    }

    /// Writer task: the single owner of the socket's send half. Applies a
    /// write deadline to every frame; a failed or stalled write is fatal
    /// to the tunnel.
    pub async fn run_writer(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut control_rx: mpsc::Receiver<Message>,
        window: Duration,
    ) {
        loop {
            let msg = tokio::select! {
                maybe = control_rx.recv() => match maybe {
                    Some(msg) => msg,
                    None => break,
                },
                _ = self.lifecycle.cancelled() => break,
            };

            let deadline = if matches!(msg, Message::Ping(_)) {
                ping_write_timeout(window)
            } else {
                window
            };

            match tokio::time::timeout(deadline, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(agent = %self.name, error = %e, "control write failed");
                    self.close();
                    break;
                }
                Err(_) => {
                    warn!(agent = %self.name, "control write deadline exceeded");
                    self.close();
                    break;
                }
            }
        }

        let _ = sink.close().await;
        debug!(agent = %self.name, "control writer stopped");
    }

    /// Keepalive loop: pings at twice the shared ping cadence so a single
    /// delayed tick still lands inside the peer's liveness window. A ping
    /// that cannot even be queued means the writer is gone.
    pub async fn run_keepalive(self: Arc<Self>, window: Duration) {
        let mut ticker = tokio::time::interval(ping_period(window) / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ping = Message::Ping(Bytes::from_static(b"backhaul"));
                    if self.control_tx.send(ping).await.is_err() {
                        warn!(agent = %self.name, "keepalive lost the control writer; closing tunnel");
                        self.close();
                        return;
                    }
                }
                _ = self.lifecycle.cancelled() => return,
            }
        }
    }

    /// Receive loop: the control connection carries no payload after
    /// registration, so everything readable is discarded. Its only job is
    /// liveness: a peer close or read error tears the tunnel down.
    pub async fn run_reader(self: Arc<Self>, mut stream: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Close(_))) => {
                        debug!(agent = %self.name, "peer closed control connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(agent = %self.name, error = %e, "control read failed");
                        break;
                    }
                    None => break,
                },
                _ = self.lifecycle.cancelled() => return,
            }
        }

        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured_request(path: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .method("GET")
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn test_tunnel(name: &str) -> (Arc<Tunnel>, mpsc::Receiver<Message>, TunnelRegistry) {
        let registry = TunnelRegistry::new();
        let (tx, rx) = mpsc::channel(32);
        let tunnel = Tunnel::new(name.to_string(), tx, registry.clone());
        registry.install(tunnel.clone());
        (tunnel, rx, registry)
    }

    async fn wait_for_pending(tunnel: &Tunnel, n: usize) -> Vec<String> {
        for _ in 0..200 {
            if tunnel.pending_len() == n {
                return tunnel.pending.iter().map(|e| e.key().clone()).collect();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending set never reached {n} entries");
    }

    #[tokio::test]
    async fn test_forward_stamps_id_and_sends_it_alone() {
        let (tunnel, mut control_rx, _registry) = test_tunnel("a");
        let fwd = tokio::spawn({
            let tunnel = tunnel.clone();
            async move {
                tunnel
                    .forward(captured_request("/proxies/a/x"), Duration::from_secs(5))
                    .await
            }
        });

        let ids = wait_for_pending(&tunnel, 1).await;
        let id = ids[0].clone();

        // Only the identifier crosses the control channel
        let msg = control_rx.recv().await.unwrap();
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), id),
            other => panic!("expected text frame, got {other:?}"),
        }

        let transit = tunnel.take_transit(&id).unwrap();
        let response = http::Response::builder()
            .status(200)
            .body(Bytes::from_static(b"{\"ok\":true}"))
            .unwrap();
        transit.respond(Ok(response));

        let delivered = fwd.await.unwrap().unwrap();
        assert_eq!(delivered.status(), 200);
        assert_eq!(tunnel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_take_transit_is_at_most_once() {
        let (tunnel, _control_rx, _registry) = test_tunnel("a");
        let _fwd = tokio::spawn({
            let tunnel = tunnel.clone();
            async move {
                tunnel
                    .forward(captured_request("/proxies/a/x"), Duration::from_secs(5))
                    .await
            }
        });

        let ids = wait_for_pending(&tunnel, 1).await;
        assert!(tunnel.take_transit(&ids[0]).is_ok());
        assert!(matches!(
            tunnel.take_transit(&ids[0]),
            Err(TunnelError::TransitNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_times_out_and_discards_transit() {
        let (tunnel, _control_rx, _registry) = test_tunnel("a");

        let err = tunnel
            .forward(captured_request("/proxies/a/x"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Timeout));
        assert_eq!(tunnel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_forward_fails_dispatch_when_writer_is_gone() {
        let (tunnel, control_rx, _registry) = test_tunnel("a");
        drop(control_rx);

        let err = tunnel
            .forward(captured_request("/proxies/a/x"), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Dispatch(_)));
        assert_eq!(tunnel.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_all_pending_callers() {
        let (tunnel, _control_rx, registry) = test_tunnel("a");

        let mut waiters = Vec::new();
        for i in 0..3 {
            let tunnel = tunnel.clone();
            waiters.push(tokio::spawn(async move {
                tunnel
                    .forward(
                        captured_request(&format!("/proxies/a/{i}")),
                        Duration::from_secs(30),
                    )
                    .await
            }));
        }

        wait_for_pending(&tunnel, 3).await;
        tunnel.close();

        for waiter in waiters {
            let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("caller stayed blocked after close")
                .unwrap();
            assert!(matches!(outcome, Err(TunnelError::Closed)));
        }

        assert_eq!(tunnel.pending_len(), 0);
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn test_keepalive_without_writer_closes_tunnel() {
        let (tunnel, control_rx, registry) = test_tunnel("a");
        drop(control_rx);

        // The first tick's ping cannot be queued; that must tear the
        // tunnel down rather than spin.
        tunnel
            .clone()
            .run_keepalive(Duration::from_millis(100))
            .await;

        assert!(tunnel.is_closed());
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tunnel, _control_rx, registry) = test_tunnel("a");
        tunnel.close();
        tunnel.close();
        assert!(tunnel.is_closed());
        assert_eq!(registry.count(), 0);
    }
}
