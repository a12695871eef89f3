//! Agent orchestrator daemon: loads config, starts the orchestration loops
//! and serves the HTTP API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ao_core::config::Config;
use ao_daemon::Daemon;
use clap::Parser;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "ao-daemon", version, about = "Agent orchestrator daemon")]
struct Args {
    /// Config file (defaults to ~/.agent-orchestrator/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `daemon.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `daemon.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit JSON logs regardless of `daemon.log_json`.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load default config")?,
    };
    if let Some(host) = args.host {
        config.daemon.host = host;
    }
    if let Some(port) = args.port {
        config.daemon.port = port;
    }

    ao_telemetry::logging::init(
        "ao-daemon",
        &config.daemon.log_level,
        args.log_json || config.daemon.log_json,
    );
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "ao-daemon starting");

    let daemon = Daemon::new(config);

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.trigger();
        }
    });

    daemon.run().await
}
