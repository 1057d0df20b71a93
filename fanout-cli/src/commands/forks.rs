//! Epoch churn and fork check run.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use fanout_client::MemoryNetwork;
use fanout_types::ConversationId;
use fanout_workers::assertions::{assert_membership_converged, assert_no_forks};
use fanout_workers::{
    get_workers, AssertionResult, EpochCheckOptions, EpochChecker, EpochReport, ForkError,
    ForkScan, HarnessConfig,
};

use super::{all_passed, manager_options};

/// Arguments for `fanout forks`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ForksArgs {
    /// Number of workers in the group
    #[arg(long, short, default_value_t = 6)]
    pub workers: usize,

    /// Churn rounds (default: from config)
    #[arg(long, short)]
    pub epochs: Option<u32>,

    /// Fork the last worker's view before churning
    #[arg(long)]
    pub inject_fork: bool,

    /// Make the injected fork survive re-adds
    #[arg(long, requires = "inject_fork")]
    pub persistent: bool,
}

/// What `fanout forks` prints.
#[derive(Debug, Serialize)]
pub struct ForksReport {
    /// Whether every check passed
    pub passed: bool,
    /// Group under test
    pub group: ConversationId,
    /// Round-by-round outcome, absent when the run failed
    pub report: Option<EpochReport>,
    /// Why the run failed
    pub error: Option<String>,
    /// Fork probe after the run
    pub scan: ForkScan,
    /// Convergence and fork checks
    pub checks: Vec<AssertionResult>,
}

/// Run the forks scenario.
pub async fn run(config: &HarnessConfig, args: &ForksArgs) -> Result<ForksReport> {
    if args.workers < 2 {
        anyhow::bail!("Need at least 2 workers to churn a group");
    }

    let network = MemoryNetwork::new();
    let manager = get_workers(args.workers, "forks", manager_options(&network, config))
        .await
        .context("Failed to provision workers")?;
    let group = manager
        .create_group_between_all(Some("forks"), &[])
        .await
        .context("Failed to create group")?;
    let group_id = group.id().clone();

    if args.inject_fork {
        let target = manager
            .get_all()
            .last()
            .cloned()
            .context("No worker to fork")?;
        network
            .inject_fork(target.db_path(), &group_id, args.persistent)
            .with_context(|| format!("Failed to fork {}", target.name()))?;
    }

    let mut options = EpochCheckOptions::from_config(&config.forks);
    if let Some(epochs) = args.epochs {
        options = options.with_epochs(epochs);
    }
    let outcome = EpochChecker::new(&manager, group_id.clone(), options).run().await;
    let scan = manager.check_forks_for_group(&group_id).await;

    let mut checks = vec![assert_no_forks(&scan)];
    let (report, error) = match outcome {
        Ok(report) => {
            checks.push(assert_membership_converged(&report.snapshots));
            (Some(report), None)
        }
        Err(err @ ForkError::UnresolvedFork { .. }) => {
            checks.push(AssertionResult::fail("epoch check", &err.to_string()));
            (None, Some(err.to_string()))
        }
        Err(err) => {
            manager.terminate_all(true).await?;
            return Err(err).context("Epoch check failed");
        }
    };
    manager.terminate_all(true).await?;

    Ok(ForksReport {
        passed: all_passed(&checks),
        group: group_id,
        report,
        error,
        scan,
        checks,
    })
}
