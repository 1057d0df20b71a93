//! # fanout
//!
//! Run harness scenarios against the in-memory protocol backend.
//!
//! ## Commands
//!
//! - `streams`: send messages through a group and measure delivery
//! - `forks`: churn group membership and check every view converges
//! - `offline`: take a worker offline, send, reconnect and check recovery
//! - `config`: print the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Ten messages to two receivers
//! fanout streams --workers 3 --messages 10
//!
//! # Same, with bob dropping every inbound event
//! fanout streams --loss-worker bob --loss 1.0
//!
//! # Three churn rounds over six workers with a forked view
//! fanout forks --workers 6 --epochs 3 --inject-fork
//! ```
//!
//! Reports are printed as JSON. Log verbosity follows `RUST_LOG`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::forks::ForksArgs;
use commands::offline::OfflineArgs;
use commands::streams::StreamsArgs;
use commands::{forks, offline, show_config, streams};

/// Run fanout harness scenarios.
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: ./fanout.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Seed for network faults, chaos and worker sampling
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure message stream delivery
    Streams(StreamsArgs),

    /// Churn a group and check for forks
    Forks(ForksArgs),

    /// Check recovery after a worker goes offline
    Offline(OfflineArgs),

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref(), cli.seed)?;

    let (json, passed) = match &cli.command {
        Commands::Streams(args) => {
            let report = streams::run(&config, args).await?;
            (serde_json::to_string_pretty(&report)?, report.passed)
        }
        Commands::Forks(args) => {
            let report = forks::run(&config, args).await?;
            (serde_json::to_string_pretty(&report)?, report.passed)
        }
        Commands::Offline(args) => {
            let report = offline::run(&config, args).await?;
            (serde_json::to_string_pretty(&report)?, report.passed)
        }
        Commands::Config => (show_config::run(&config)?, true),
    };

    println!("{}", json);
    if !passed {
        anyhow::bail!("Scenario failed");
    }
    Ok(())
}
