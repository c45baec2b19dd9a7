//! Agent side of the backhaul reverse tunnel.
//!
//! The agent lives next to a private HTTP service and only ever dials out.
//! It registers a long-lived control connection with the gateway and keeps
//! it alive with pings; every text frame arriving on it is a request
//! identifier. For each identifier the agent opens a dedicated ephemeral
//! connection back to the gateway, fetches the full request, executes it
//! against the local target, and writes the full response back on the same
//! connection. Losing the control connection triggers a reset: close,
//! pause through a backoff, re-register.

pub mod backoff;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use backhaul_proto::{
    codec, ping_period, ping_write_timeout, strip_proxy_prefix, DEFAULT_KEEPALIVE_WINDOW,
    REQUEST_ID_HEADER,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::proxy::HttpProxy;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name this agent registers under; the routing key on the gateway.
    pub agent_name: String,

    /// Gateway address as host:port.
    pub gateway_addr: String,

    /// Local HTTP target as host:port.
    pub target_addr: String,

    /// Bearer token presented to the gateway, if it requires one.
    pub auth_token: Option<String>,

    /// Liveness window shared with the gateway.
    pub keepalive_window: Duration,

    /// Re-registration pacing.
    pub backoff: BackoffConfig,
}

impl AgentConfig {
    pub fn new(agent_name: String, gateway_addr: String, target_addr: String) -> Self {
        Self {
            agent_name,
            gateway_addr,
            target_addr,
            auth_token: None,
            keepalive_window: DEFAULT_KEEPALIVE_WINDOW,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Agent-side failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gateway closed the control connection")]
    ControlClosed,

    #[error("ping write stalled past its deadline")]
    PingTimeout,

    #[error("malformed wire message: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The agent process: one control session at a time, re-registered
/// forever, plus one task per dispatched request.
pub struct Agent {
    config: AgentConfig,
    proxy: Arc<HttpProxy>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let proxy = Arc::new(HttpProxy::new(config.target_addr.clone()));
        Self { config, proxy }
    }

    /// Run until cancelled: register, serve the control connection, and on
    /// any failure reset with backoff and register again.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            match self.run_control_session(&mut backoff).await {
                Ok(()) => {
                    info!(agent = %self.config.agent_name, "control session ended");
                }
                Err(e) => {
                    warn!(agent = %self.config.agent_name, error = %e, "control session failed");
                }
            }
            backoff.wait().await;
        }
    }

    /// One registration: dial the control endpoint and serve it until the
    /// connection dies.
    async fn run_control_session(&self, backoff: &mut Backoff) -> Result<(), AgentError> {
        let url = format!(
            "ws://{}/agents/{}/register",
            self.config.gateway_addr, self.config.agent_name
        );
        let request = self.handshake_request(&url)?;

        let (socket, _) = connect_async(request).await?;
        info!(
            agent = %self.config.agent_name,
            gateway = %self.config.gateway_addr,
            "registered with gateway"
        );
        backoff.reset();

        let window = self.config.keepalive_window;
        let (mut sink, mut stream) = socket.split();
        let mut ping = tokio::time::interval(ping_period(window));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let send = sink.send(Message::Ping(Vec::new()));
                    tokio::time::timeout(ping_write_timeout(window), send)
                        .await
                        .map_err(|_| AgentError::PingTimeout)??;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(id))) => self.spawn_dispatch(id),
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(AgentError::ControlClosed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Each dispatched identifier gets its own task so one slow request
    /// never delays the control connection or other requests.
    fn spawn_dispatch(&self, request_id: String) {
        debug!(agent = %self.config.agent_name, request_id = %request_id, "request dispatched");
        let config = self.config.clone();
        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_dispatch(&config, proxy, &request_id).await {
                warn!(request_id = %request_id, error = %e, "dispatch handling failed");
            }
        });
    }

    fn handshake_request(
        &self,
        url: &str,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, AgentError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| AgentError::Config(format!("bad gateway address: {e}")))?;
        apply_auth(&mut request, &self.config.auth_token)?;
        Ok(request)
    }
}

fn apply_auth(
    request: &mut tokio_tungstenite::tungstenite::handshake::client::Request,
    token: &Option<String>,
) -> Result<(), AgentError> {
    if let Some(token) = token {
        let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| AgentError::Config("auth token is not a valid header value".into()))?;
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, value);
    }
    Ok(())
}

/// Run the data-plane exchange for one request identifier: fetch the
/// payload over a fresh ephemeral connection, execute it locally, and
/// write the response back.
async fn handle_dispatch(
    config: &AgentConfig,
    proxy: Arc<HttpProxy>,
    request_id: &str,
) -> Result<(), AgentError> {
    let url = format!(
        "ws://{}/agents/{}/response",
        config.gateway_addr, config.agent_name
    );
    let mut request = url
        .into_client_request()
        .map_err(|e| AgentError::Config(format!("bad gateway address: {e}")))?;
    let id_value = http::HeaderValue::from_str(request_id)
        .map_err(|_| AgentError::Protocol("request id is not a valid header value".into()))?;
    request.headers_mut().insert(REQUEST_ID_HEADER, id_value);
    apply_auth(&mut request, &config.auth_token)?;

    let (mut socket, _) = connect_async(request).await?;

    let payload = read_request_frame(&mut socket).await?;
    let mut captured = codec::decode_request(&payload)?;
    rewrite_path(&mut captured, &config.agent_name)?;
    debug!(
        request_id = %request_id,
        method = %captured.method(),
        path = %captured.uri(),
        "executing against local target"
    );

    let response = match proxy.forward(captured).await {
        Ok(response) => response,
        Err(e) => {
            // The waiter on the gateway still needs an answer; a local
            // failure becomes a 502 rather than a hang.
            warn!(request_id = %request_id, error = %e, "local forward failed");
            bad_gateway_response(&e)
        }
    };

    socket
        .send(Message::Binary(codec::encode_response(&response)))
        .await?;
    let _ = socket.close(None).await;
    Ok(())
}

async fn read_request_frame(socket: &mut WsStream) -> Result<Vec<u8>, AgentError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Text(_))) => {
                return Err(AgentError::Protocol(
                    "expected a binary request frame".into(),
                ));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(AgentError::Protocol(
                    "ephemeral connection closed before the request arrived".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Strip the gateway routing prefix so the local service sees its native
/// path.
fn rewrite_path(request: &mut http::Request<Bytes>, agent: &str) -> Result<(), AgentError> {
    let original = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let stripped = strip_proxy_prefix(original, agent);
    *request.uri_mut() = stripped
        .parse()
        .map_err(|_| AgentError::Protocol(format!("unusable request path {stripped}")))?;
    Ok(())
}

fn bad_gateway_response(err: &proxy::ProxyError) -> http::Response<Bytes> {
    let body = Bytes::from(format!("local forward failed: {err}"));
    http::Response::builder()
        .status(http::StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| http::Response::new(Bytes::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_path_strips_routing_prefix() {
        let mut request = http::Request::builder()
            .method("GET")
            .uri("/proxies/huawei/status?verbose=1")
            .body(Bytes::new())
            .unwrap();

        rewrite_path(&mut request, "huawei").unwrap();
        assert_eq!(request.uri().path(), "/status");
        assert_eq!(request.uri().query(), Some("verbose=1"));
    }

    #[test]
    fn test_rewrite_path_without_prefix_is_no_op() {
        let mut request = http::Request::builder()
            .method("GET")
            .uri("/native/path")
            .body(Bytes::new())
            .unwrap();

        rewrite_path(&mut request, "huawei").unwrap();
        assert_eq!(request.uri().path(), "/native/path");
    }

    #[test]
    fn test_bad_gateway_response_carries_error() {
        let err = proxy::ProxyError::BadRequest("boom".to_string());
        let response = bad_gateway_response(&err);
        assert_eq!(response.status(), 502);
        assert!(String::from_utf8_lossy(response.body()).contains("boom"));
    }
}
