//! # TaskHive CLI
//!
//! Runs the autonomy loop as a long-lived process.
//!
//! Usage:
//!   taskhive                               # defaults, supervised autonomy
//!   taskhive --config taskhive.toml        # explicit configuration
//!   taskhive --storage ./data --autonomy full
//!   taskhive --log-level taskhive=debug

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use taskhive::{AutonomyLevel, AutonomyLoop, TaskhiveConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskhive",
    version,
    about = "🐝 TaskHive — persistent task execution and scheduling for agent systems"
)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory override
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Autonomy level override (disabled, assisted, supervised, full)
    #[arg(short, long)]
    autonomy: Option<AutonomyLevel>,

    /// Log filter (e.g. info, debug, taskhive=debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => TaskhiveConfig::load(path)?,
        None => TaskhiveConfig::default(),
    };
    if let Some(storage) = &cli.storage {
        config.storage_dir = Some(storage.display().to_string());
    }
    if let Some(level) = cli.autonomy {
        config.autonomy.default_level = level;
    }

    let core = AutonomyLoop::new(config)?;
    core.start();
    tracing::info!("TaskHive running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    core.stop(true, Duration::from_secs(30)).await;

    Ok(())
}
