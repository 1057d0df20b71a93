//! Message stream delivery run.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use fanout_client::MemoryNetwork;
use fanout_types::{NetworkConditions, StreamKind};
use fanout_workers::assertions::{assert_order, assert_reception};
use fanout_workers::{
    get_workers, verify_message_stream, AssertionResult, HarnessConfig, VerificationResult,
    VerifyOptions, WorkerSummary,
};

use super::{all_passed, manager_options};

/// Arguments for `fanout streams`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct StreamsArgs {
    /// Number of workers (one sender, the rest receive)
    #[arg(long, short, default_value_t = 3)]
    pub workers: usize,

    /// Messages to send
    #[arg(long, short, default_value_t = 10)]
    pub messages: usize,

    /// Worker whose link loses packets
    #[arg(long, requires = "loss")]
    pub loss_worker: Option<String>,

    /// Packet loss rate for --loss-worker (0..=1)
    #[arg(long, requires = "loss_worker")]
    pub loss: Option<f64>,

    /// Per-receiver timeout in milliseconds (default: from config)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// What `fanout streams` prints.
#[derive(Debug, Serialize)]
pub struct StreamsReport {
    /// Whether every check passed
    pub passed: bool,
    /// Workers that took part
    pub workers: Vec<WorkerSummary>,
    /// Delivery measurements
    pub result: VerificationResult,
    /// Threshold and order checks
    pub checks: Vec<AssertionResult>,
}

/// Run the streams scenario.
pub async fn run(config: &HarnessConfig, args: &StreamsArgs) -> Result<StreamsReport> {
    if args.workers < 2 {
        anyhow::bail!("Need at least 2 workers (one sender, one receiver)");
    }

    let network = MemoryNetwork::new();
    let manager = get_workers(
        args.workers,
        "streams",
        manager_options(&network, config).with_stream(StreamKind::Message),
    )
    .await
    .context("Failed to provision workers")?;
    let group = manager
        .create_group_between_all(Some("streams"), &[])
        .await
        .context("Failed to create group")?;

    if let (Some(name), Some(rate)) = (&args.loss_worker, args.loss) {
        manager
            .set_worker_network_conditions(name, NetworkConditions::none().packet_loss(rate))
            .with_context(|| format!("Failed to apply packet loss to {}", name))?;
    }

    let mut options = VerifyOptions::from_config(&config.streams);
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(std::time::Duration::from_millis(ms));
    }
    let receivers = manager.get_all_but_creator();
    let result = verify_message_stream(&group, &receivers, args.messages, &options).await;

    let checks = vec![
        assert_reception(&result, options.almost_all_threshold),
        assert_order(&result),
    ];
    let workers = manager.describe();
    manager.terminate_all(true).await?;

    Ok(StreamsReport {
        passed: all_passed(&checks),
        workers,
        result,
        checks,
    })
}
