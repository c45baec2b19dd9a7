//! Backhaul gateway binary.
//!
//! Publicly reachable endpoint that accepts agent registrations and routes
//! `/proxies/{agent}/...` traffic to them over their reverse tunnels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backhaul_gateway::{router, AllowAll, AppState, Authenticate, BearerToken, GatewayConfig, TunnelRegistry};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul gateway - routes public HTTP traffic to agents behind firewalls
#[derive(Parser, Debug)]
#[command(name = "backhaul-gateway")]
#[command(about = "Backhaul gateway - routes public HTTP traffic to agents behind firewalls")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BACKHAUL_BIND", default_value = "0.0.0.0:9991")]
    bind: SocketAddr,

    /// Seconds a forwarded request may wait for the agent's response
    #[arg(long, env = "BACKHAUL_FORWARD_TIMEOUT", default_value_t = 30)]
    forward_timeout: u64,

    /// Keepalive liveness window in seconds
    #[arg(long, env = "BACKHAUL_KEEPALIVE_WINDOW", default_value_t = 10)]
    keepalive_window: u64,

    /// Shared bearer token required on every endpoint (default: allow all)
    #[arg(long, env = "BACKHAUL_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let config = GatewayConfig {
        bind_addr: args.bind,
        forward_timeout: Duration::from_secs(args.forward_timeout),
        keepalive_window: Duration::from_secs(args.keepalive_window),
        ..GatewayConfig::default()
    };

    let auth: Arc<dyn Authenticate> = match args.auth_token {
        Some(token) => {
            info!("Bearer-token authentication enabled");
            Arc::new(BearerToken::new(token))
        }
        None => Arc::new(AllowAll),
    };

    let state = AppState {
        registry: TunnelRegistry::new(),
        auth,
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    info!(
        addr = %config.bind_addr,
        forward_timeout_secs = config.forward_timeout.as_secs(),
        "Gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        })
        .await
        .context("Gateway server failed")?;

    info!("Gateway stopped");
    Ok(())
}
