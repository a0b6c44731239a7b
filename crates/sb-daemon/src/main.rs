//! switchboard daemon: loads config, opens the store and serves the
//! command surface until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sb_core::config::{Config, StorageBackend};
use sb_daemon::daemon::Daemon;
use sb_harness::provider::ClientSet;
use sb_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about = "AI task orchestration control plane")]
struct Cli {
    /// Path to switchboard.toml
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    /// Override `daemon.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `daemon.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep everything in memory
    #[arg(long)]
    ephemeral: bool,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(Some(&cli.config)).context("failed to load config")?;
    if let Some(host) = cli.host {
        config.daemon.host = host;
    }
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    if cli.ephemeral {
        config.storage.backend = StorageBackend::Memory;
    }
    config.validate().context("invalid config")?;

    let format = LogFormat::from_json_flag(cli.json_logs || config.general.json_logs);
    logging::init("switchboard", &config.general.log_level, format);
    info!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    // Vendor HTTP clients are registered here; unregistered providers fall
    // back to the stub and report themselves as not configured.
    let daemon = Daemon::new(config, ClientSet::new()).await?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.cancel();
    });

    daemon.run().await
}
