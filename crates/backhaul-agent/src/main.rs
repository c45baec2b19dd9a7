//! Backhaul agent binary.
//!
//! Runs next to a private HTTP service, registers with a backhaul gateway,
//! and serves requests the gateway forwards through the reverse tunnel.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backhaul_agent::{Agent, AgentConfig};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul reverse tunnel agent - exposes a private HTTP service through a gateway
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Backhaul reverse tunnel agent - exposes a private HTTP service through a gateway")]
#[command(version)]
#[command(long_about = r#"
The agent dials out to a backhaul gateway and registers under a name;
the gateway then routes /proxies/{name}/... traffic to the local HTTP
target. The agent never accepts inbound connections.

EXAMPLES:
  # Register as "huawei" and expose a local service
  backhaul-agent --gateway 203.0.113.7:9991 --name huawei --target 127.0.0.1:8080

  # Use a config file
  backhaul-agent --config agent-config.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_GATEWAY     Gateway address (host:port)
  BACKHAUL_AGENT_NAME  Name to register under
  BACKHAUL_TARGET      Local HTTP target (host:port)
  BACKHAUL_AUTH_TOKEN  Bearer token, if the gateway requires one
"#)]
struct Args {
    /// Gateway address (host:port)
    #[arg(long, env = "BACKHAUL_GATEWAY")]
    gateway: Option<String>,

    /// Name to register under
    #[arg(long, env = "BACKHAUL_AGENT_NAME")]
    name: Option<String>,

    /// Local HTTP target to forward to (host:port)
    #[arg(long, env = "BACKHAUL_TARGET")]
    target: Option<String>,

    /// Bearer token presented to the gateway
    #[arg(long, env = "BACKHAUL_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    /// Gateway configuration
    gateway: GatewaySection,

    /// Agent configuration
    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct GatewaySection {
    /// Gateway address (host:port)
    address: String,

    /// Environment variable holding the bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token_env: Option<String>,

    /// Direct bearer token (prefer auth_token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentSection {
    /// Name to register under
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// Local HTTP target (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
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

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args.
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let (gateway, auth_token, mut name, mut target) = if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        let config_file = load_config_file(config_path)?;

        let auth_token = if let Some(env_var) = &config_file.gateway.auth_token_env {
            Some(
                std::env::var(env_var)
                    .with_context(|| format!("Environment variable {} not set", env_var))?,
            )
        } else {
            config_file.gateway.auth_token
        };

        (
            config_file.gateway.address,
            auth_token,
            config_file.agent.name,
            config_file.agent.target,
        )
    } else {
        (String::new(), None, None, None)
    };

    let gateway = args.gateway.unwrap_or(gateway);
    let auth_token = args.auth_token.or(auth_token);
    if args.name.is_some() {
        name = args.name;
    }
    if args.target.is_some() {
        target = args.target;
    }

    if gateway.is_empty() {
        anyhow::bail!("Gateway address is required (use --gateway or config file)");
    }
    let name =
        name.ok_or_else(|| anyhow::anyhow!("Agent name is required (use --name or config file)"))?;
    let target = target
        .ok_or_else(|| anyhow::anyhow!("Target address is required (use --target or config file)"))?;

    validate_address(&gateway, "gateway")?;
    validate_address(&target, "target")?;

    let mut config = AgentConfig::new(name, gateway, target);
    config.auth_token = auth_token;
    Ok(config)
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 || parts[1].is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    }

    parts[0]
        .parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Backhaul agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    info!("Agent name: {}", config.agent_name);
    info!("Gateway: {}", config.gateway_addr);
    info!("Target: {}", config.target_addr);

    let agent = Agent::new(config);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let agent_task = tokio::spawn(async move { agent.run().await });

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = agent_task => {
            match result {
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Ok(Ok(())) => {}
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("gateway.example.com:9991", "gateway").is_ok());
        assert!(validate_address("127.0.0.1:8080", "target").is_ok());

        assert!(validate_address("gateway.example.com", "gateway").is_err());
        assert!(validate_address("gateway.example.com:", "gateway").is_err());
        assert!(validate_address("gateway.example.com:abc", "gateway").is_err());
        assert!(validate_address(":9991", "gateway").is_err());
        assert!(validate_address("", "target").is_err());
    }

    #[test]
    fn test_cli_args_take_precedence() {
        let args = Args {
            gateway: Some("127.0.0.1:9991".to_string()),
            name: Some("huawei".to_string()),
            target: Some("127.0.0.1:8080".to_string()),
            auth_token: None,
            config: None,
            log_level: "info".to_string(),
        };

        let config = build_agent_config(args).unwrap();
        assert_eq!(config.agent_name, "huawei");
        assert_eq!(config.gateway_addr, "127.0.0.1:9991");
        assert_eq!(config.target_addr, "127.0.0.1:8080");
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_missing_gateway_is_rejected() {
        let args = Args {
            gateway: None,
            name: Some("huawei".to_string()),
            target: Some("127.0.0.1:8080".to_string()),
            auth_token: None,
            config: None,
            log_level: "info".to_string(),
        };

        assert!(build_agent_config(args).is_err());
    }
}
