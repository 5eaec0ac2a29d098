// slotsyncd: standalone daemon entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use slotsync_daemon::config::DaemonConfig;
use slotsync_daemon::startup::DaemonPaths;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "slotsyncd", version, about = "Workspace state sync daemon")]
struct Args {
    /// Config file (default: ~/.slotsync/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Database file, overriding `storage.db_path`.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("failed to load config")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db) = args.db {
        config.storage.db_path = Some(db);
    }
    config.validate().context("invalid configuration")?;

    let paths = DaemonPaths::resolve(&config)?;
    info!(bind = %config.server.bind, "starting slotsync daemon");
    slotsync_daemon::runtime::run_standalone(config, paths)
        .await
        .context("slotsync daemon terminated unexpectedly")
}
