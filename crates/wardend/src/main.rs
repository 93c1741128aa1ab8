//! wardend - keeps the Termux services up
//!
//! Probes endpoints, restarts dead pm2 services and holds a wake lock while
//! the battery allows.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden_common::config::CONFIG_PATH;
use wardend::{daemon, ConfigStore};

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Self-healing service supervisor")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("wardend v{} starting", env!("CARGO_PKG_VERSION"));

    // Invalid configuration is the one thing that stops us starting
    let config = ConfigStore::load(&args.config)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    daemon::run(config).await
}
