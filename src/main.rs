use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use zerolink_lib::{logging, Config, EchoService, Node, ServiceDirectory};

#[derive(Debug, Parser)]
#[command(name = "zerolink", version, about = "Run a zerolink peer on the local network")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Coordinator address to probe for routed mode
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// Relay routed payloads for other peers
    #[arg(long)]
    coordinator: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.session.bind.set_port(port);
    }
    if let Some(relay) = cli.relay {
        config.connectivity.relay = Some(relay);
    }
    if cli.coordinator {
        config.node.coordinator = true;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _log_guard = logging::init(&config.logging)?;

    let services = Arc::new(ServiceDirectory::new());
    services.register(Arc::new(EchoService::new("Echo")), "");

    let node = Node::start(config, services)
        .await
        .context("Failed to start node")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    node.shutdown().await;

    Ok(())
}
