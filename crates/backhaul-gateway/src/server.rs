//! HTTP control surface of the gateway.
//!
//! Three endpoints make up the routing contract:
//!
//! - `GET /agents/{agent}/register` upgrades to the agent's long-lived
//!   control connection.
//! - `ANY /proxies/{agent}/<rest>` is the external-facing proxied request.
//! - `GET /agents/{agent}/response` is the per-request ephemeral
//!   connection opened by the agent, correlated by the `x-request-id`
//!   handshake header.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use backhaul_proto::REQUEST_ID_HEADER;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Authenticate;
use crate::config::GatewayConfig;
use crate::error::StatusError;
use crate::registry::TunnelRegistry;
use crate::tunnel::Tunnel;

/// Outbound control frames buffered between the tunnel and its writer task.
const CONTROL_QUEUE: usize = 32;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub auth: Arc<dyn Authenticate>,
    pub config: GatewayConfig,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agents/{agent}/register", get(register_handler))
        .route("/agents/{agent}/response", get(response_handler))
        .route("/proxies/{agent}", any(proxy_root_handler))
        .route("/proxies/{agent}/{*rest}", any(proxy_rest_handler))
        .with_state(state)
}

/// Establish an agent's control connection.
async fn register_handler(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = state.auth.authenticate(&headers).await {
        return StatusError::new(StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    ws.on_upgrade(move |socket| run_control(socket, agent, state))
}

/// Drive one registered control connection until it dies.
async fn run_control(socket: WebSocket, agent: String, state: AppState) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let tunnel = Tunnel::new(agent.clone(), control_tx, state.registry.clone());

    if let Some(superseded) = state.registry.install(tunnel.clone()) {
        superseded.close();
    }
    info!(agent = %agent, "agent registered");

    let window = state.config.keepalive_window;
    let (sink, stream) = socket.split();
    tokio::spawn(tunnel.clone().run_writer(sink, control_rx, window));
    tokio::spawn(tunnel.clone().run_keepalive(window));
    tunnel.run_reader(stream).await;
}

async fn proxy_root_handler(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    request: Request,
) -> Response {
    handle_proxy(state, agent, request).await
}

async fn proxy_rest_handler(
    State(state): State<AppState>,
    Path((agent, _rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    handle_proxy(state, agent, request).await
}

/// Forward an external request through the agent's tunnel and relay the
/// response.
async fn handle_proxy(state: AppState, agent: String, request: Request) -> Response {
    if let Err(err) = state.auth.authenticate(request.headers()).await {
        return StatusError::new(StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    let Some(tunnel) = state.registry.get(&agent) else {
        return StatusError::new(
            StatusCode::NOT_FOUND,
            format!("no agent registered as {agent}"),
        )
        .into_response();
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            return StatusError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("failed to capture request body: {e}"),
            )
            .into_response();
        }
    };
    let captured = http::Request::from_parts(parts, body);

    match tunnel.forward(captured, state.config.forward_timeout).await {
        Ok(response) => response.map(axum::body::Body::from).into_response(),
        Err(err) => {
            if err.is_transport_fault() {
                // Self-healing eviction: a dead registration should not
                // keep answering to this name.
                warn!(agent = %agent, error = %err, "transport fault during forward; evicting tunnel");
                tunnel.close();
            }
            StatusError::from(err).into_response()
        }
    }
}

/// Accept an agent's ephemeral data-plane connection and run the payload
/// exchange for the transit it names.
async fn response_handler(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = state.auth.authenticate(&headers).await {
        return StatusError::new(StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return StatusError::new(
            StatusCode::CONFLICT,
            "ephemeral connection carries no request id",
        )
        .into_response();
    };

    let Some(tunnel) = state.registry.get(&agent) else {
        return StatusError::new(
            StatusCode::NOT_FOUND,
            format!("no agent registered as {agent}"),
        )
        .into_response();
    };

    ws.on_upgrade(move |socket| run_data_plane(socket, tunnel, request_id))
}

async fn run_data_plane(mut socket: WebSocket, tunnel: Arc<Tunnel>, request_id: String) {
    debug!(agent = %tunnel.name(), request_id = %request_id, "ephemeral connection accepted");

    let transit = match tunnel.take_transit(&request_id) {
        Ok(transit) => transit,
        Err(err) => {
            warn!(agent = %tunnel.name(), request_id = %request_id, error = %err, "unclaimable transit");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    if let Err(err) = transit.transit(&mut socket).await {
        warn!(agent = %tunnel.name(), request_id = %request_id, error = %err, "request payload leg failed");
        transit.respond(Err(err));
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    if let Err(err) = transit.deliver(&mut socket).await {
        warn!(agent = %tunnel.name(), request_id = %request_id, error = %err, "response delivery failed");
    }

    // Closed regardless of outcome; the connection is scoped to one transit.
    let _ = socket.send(Message::Close(None)).await;
}
