//! lazy-manager broker daemon
//!
//! Connects out to fleet agents and operator consoles and relays messages
//! between them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lz_core::config::{self, BrokerConfig};
use lz_core::PeerAddr;
use lz_manager::Broker;

#[derive(Parser)]
#[command(name = "lz-manager")]
#[command(about = "lazy-manager connection broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "LZ_CONFIG")]
    config: Option<PathBuf>,

    /// Agent port (overrides config)
    #[arg(long)]
    agent_port: Option<u16>,

    /// Console port (overrides config)
    #[arg(long)]
    app_port: Option<u16>,

    /// Agent address or last-octet range such as 10.0.0.2-27 (replaces the
    /// configured list, repeatable)
    #[arg(long = "agent", value_name = "ADDR")]
    agents: Vec<String>,

    /// Additional console address to dial (repeatable)
    #[arg(long = "app", value_name = "ADDR")]
    apps: Vec<PeerAddr>,

    /// Do not browse for consoles over mDNS
    #[arg(long)]
    no_discovery: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("lazy-manager starting...");

    let mut config = load_config(args.config.as_ref())?;
    apply_overrides(&mut config, &args);

    let broker = Broker::new(config).context("Invalid configuration")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_clone.cancel();
    });

    broker.run(cancel).await?;

    tracing::info!("lazy-manager shutdown complete");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<BrokerConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            BrokerConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(BrokerConfig::default())
    }
}

fn apply_overrides(config: &mut BrokerConfig, args: &Args) {
    if let Some(port) = args.agent_port {
        config.agent_port = port;
    }
    if let Some(port) = args.app_port {
        config.app_port = port;
    }
    if !args.agents.is_empty() {
        config.agents = args.agents.clone();
    }
    for app in &args.apps {
        if !config.apps.contains(app) {
            config.apps.push(*app);
        }
    }
    if args.no_discovery {
        config.discovery.enabled = false;
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
