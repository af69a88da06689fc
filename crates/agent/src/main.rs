use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use relay_agent::{connect_gateway, Agent, AgentConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-agent", version, about = "Claims and runs work items on this machine")]
struct Cli {
    /// TOML config file. Built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Destination identifier (stable string). Overrides the config file.
    #[arg(long)]
    destination_id: Option<String>,

    /// Backend endpoint, e.g. surrealkv://.relay/db, ws://127.0.0.1:8000 or memory.
    #[arg(long)]
    endpoint: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load_from(path)?,
        None => AgentConfig::default(),
    };
    if let Some(id) = cli.destination_id {
        config.destination.id = Some(id);
    }
    if let Some(endpoint) = cli.endpoint {
        config.backend.endpoint = endpoint;
    }

    let gateway = connect_gateway(&config.backend).await?;
    let agent = Agent::new(config, gateway);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    agent.run(stop_rx).await
}
