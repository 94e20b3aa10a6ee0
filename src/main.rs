//! Edge Tunnel - secure tunnel agent for edge devices
//!
//! Waits for tunnel notifications (or opens one static tunnel) and bridges
//! each tunnel to the local service it asks for.

use anyhow::{Context, Result};
use clap::Parser;
use edgetunnel_agent::{FeatureEvent, TunnelingConfig, TunnelingFeature};
use edgetunnel_transport::JsonLinesNotificationSource;
use edgetunnel_transport_websocket::{WebSocketRelayConfig, WebSocketRelayConnector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Edge Tunnel - open secure tunnels to services on this device
#[derive(Parser, Debug)]
#[command(name = "edgetunnel")]
#[command(about = "Edge Tunnel - open secure tunnels to services on this device")]
#[command(version = VERSION)]
#[command(long_about = r#"
Edge Tunnel waits for tunnel notifications addressed to this device and
bridges every accepted tunnel to the local service it requests (SSH, GW,
TIVA, ...). With an access token on the command line it instead opens a
single static tunnel to the given address and port.

EXAMPLES:
  # Serve tunnel notifications read from a FIFO
  edgetunnel --thing-name gateway-01 --notifications /run/edgetunnel/notify

  # Open one static tunnel to the local SSH daemon
  edgetunnel --access-token $TOKEN --region eu-west-1 \
    --address 127.0.0.1 --port 22

  # Use a config file, stop once the tunnel closes
  edgetunnel --config /etc/edgetunnel.yaml --exit-on-close

ENVIRONMENT VARIABLES:
  EDGETUNNEL_THING_NAME     Thing name used for the notification topic
  EDGETUNNEL_NOTIFICATIONS  JSON-lines notification file or FIFO
  EDGETUNNEL_ACCESS_TOKEN   Destination access token (static mode)
  EDGETUNNEL_REGION         Tunneling region (static mode)
"#)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Thing name used for the notification subscription
    #[arg(long, env = "EDGETUNNEL_THING_NAME")]
    thing_name: Option<String>,

    /// File or FIFO delivering tunnel notifications, one JSON document per line
    #[arg(long, env = "EDGETUNNEL_NOTIFICATIONS")]
    notifications: Option<PathBuf>,

    /// Destination access token, selects static mode
    #[arg(long, env = "EDGETUNNEL_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Tunneling region (e.g., us-east-1)
    #[arg(long, env = "EDGETUNNEL_REGION")]
    region: Option<String>,

    /// Destination IPv4 address of the static tunnel
    #[arg(long)]
    address: Option<String>,

    /// Destination TCP port of the static tunnel
    #[arg(long)]
    port: Option<u32>,

    /// Relay endpoint override (derived from the region by default)
    #[arg(long)]
    endpoint: Option<String>,

    /// Additional root CA (PEM) trusted for the relay connection
    #[arg(long)]
    root_ca: Option<PathBuf>,

    /// Link state file deciding the route of link-dependent services
    #[arg(long)]
    link_state_path: Option<PathBuf>,

    /// Exit as soon as a tunnel closes
    #[arg(long)]
    exit_on_close: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_config(cli: &Cli) -> Result<TunnelingConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            TunnelingConfig::load(path)?
        }
        None => TunnelingConfig::default(),
    };

    if cli.thing_name.is_some() {
        config.thing_name = cli.thing_name.clone();
    }
    if cli.access_token.is_some() {
        config.destination_access_token = cli.access_token.clone();
        config.subscribe_notification = false;
    }
    if cli.region.is_some() {
        config.region = cli.region.clone();
    }
    if cli.address.is_some() {
        config.address = cli.address.clone();
    }
    if cli.port.is_some() {
        config.port = cli.port;
    }
    if cli.endpoint.is_some() {
        config.endpoint = cli.endpoint.clone();
    }
    if cli.root_ca.is_some() {
        config.root_ca = cli.root_ca.clone();
    }
    if let Some(path) = &cli.link_state_path {
        config.link_state_path = path.clone();
    }
    if cli.exit_on_close {
        config.exit_on_tunnel_close = true;
    }

    config
        .validate()
        .context("Invalid tunneling configuration")?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    setup_logging(log_level)?;

    info!("Edge Tunnel {} starting...", VERSION);

    let config = build_config(&cli).context("Failed to build configuration")?;

    if config.subscribe_notification {
        info!(
            "Mode: notifications for {}",
            config.thing_name.as_deref().unwrap_or_default()
        );
    } else {
        info!("Mode: static tunnel");
    }
    if config.exit_on_tunnel_close {
        info!("Will exit when a tunnel closes");
    }

    let mut relay_config = WebSocketRelayConfig::default();
    if let Some(root_ca) = &config.root_ca {
        relay_config = relay_config.with_root_ca(root_ca.clone());
    }
    let connector = WebSocketRelayConnector::new(relay_config)
        .context("Failed to create relay connector")?;

    let (feature, mut events) = TunnelingFeature::from_config(config, Arc::new(connector))
        .context("Failed to create tunneling feature")?;
    let mut feature = match cli.notifications {
        Some(path) => feature.with_notification_source(Arc::new(JsonLinesNotificationSource::new(path))),
        None => feature,
    };

    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                event = events.recv() => match event {
                    Some(FeatureEvent::Started) => info!("Tunneling feature started"),
                    Some(FeatureEvent::ShutdownRequested { session_id }) => {
                        info!(session_id = %session_id, "Tunnel closed, shutting down...");
                        break;
                    }
                    Some(FeatureEvent::Stopped) | None => {
                        warn!("Tunneling feature stopped unexpectedly");
                        break;
                    }
                },
            }
        }
    };

    feature.run(shutdown).await?;

    info!("Edge Tunnel stopped");
    Ok(())
}
