//! Tether server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tether_server::config::default_config_path;
use tether_server::{AppState, ServerConfig, app};
use tether_store::ConversationStore;

/// Self-hosted bridge server connecting remote clients to a local CLI
/// agent.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
struct Args {
    /// Config file location (created on first run).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tether_core::logging::init("tether=info");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config =
        ServerConfig::load_or_init(&config_path).context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let store = ConversationStore::open(&config.database_path)
        .context("failed to open conversation store")?;

    let bind = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, store);
    let gate = state.gate.clone();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(
        addr = %listener.local_addr()?,
        config = %config_path.display(),
        "tether server listening"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested — cancelling active turns");
            gate.shutdown();
        })
        .await?;
    Ok(())
}
