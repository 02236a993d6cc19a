//! Command-line interface for workload-replay
//!
//! # Usage Examples
//!
//! ```bash
//! # Replay a locally extracted workload
//! REPLAY_MASTER_PASSWORD=... workload-replay replay.yaml
//!
//! # Replay straight from object storage with verbose logging
//! RUST_LOG=workload_replay=debug,replay_exec=debug \
//!   workload-replay s3-replay.yaml --workers 8
//! ```
//!
//! The configuration file names the workload location, the target cluster
//! endpoint, credential acquisition, pacing overrides and filters; see
//! `workload_replay::config::Config`.

use clap::Parser;
use std::path::PathBuf;
use workload_replay::config::Config;

#[derive(Parser)]
#[command(name = "workload-replay", version, about)]
struct Cli {
    /// Path to the replay configuration file
    #[arg(default_value = "replay.yaml", env = "REPLAY_CONFIG")]
    config: PathBuf,

    /// Override the configured number of worker tasks
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    workload_replay::replay::run(&config, cli.workers).await
}
