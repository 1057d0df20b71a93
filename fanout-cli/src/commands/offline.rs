//! Offline recovery run.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use fanout_client::MemoryNetwork;
use fanout_workers::assertions::assert_recovered_messages;
use fanout_workers::{get_workers, AssertionResult, HarnessConfig};

use super::manager_options;

/// Arguments for `fanout offline`.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct OfflineArgs {
    /// Number of workers in the group
    #[arg(long, short, default_value_t = 3)]
    pub workers: usize,

    /// Messages sent while the receiver is offline
    #[arg(long, short, default_value_t = 10)]
    pub messages: usize,
}

/// What `fanout offline` prints.
#[derive(Debug, Serialize)]
pub struct OfflineReport {
    /// Whether the recovery check passed
    pub passed: bool,
    /// Worker taken offline
    pub worker: String,
    /// Messages sent while it was away
    pub sent: usize,
    /// Text messages in its history after reconnecting
    pub recovered: usize,
    /// Set-equality check
    pub check: AssertionResult,
}

/// Run the offline scenario: the receiver goes away, the creator sends,
/// the receiver comes back and syncs.
pub async fn run(config: &HarnessConfig, args: &OfflineArgs) -> Result<OfflineReport> {
    if args.workers < 2 {
        anyhow::bail!("Need at least 2 workers (one sender, one offline receiver)");
    }

    let network = MemoryNetwork::new();
    let manager = get_workers(args.workers, "offline", manager_options(&network, config))
        .await
        .context("Failed to provision workers")?;
    let group = manager
        .create_group_between_all(Some("offline"), &[])
        .await
        .context("Failed to create group")?;
    let receiver = manager.receiver()?;

    receiver.terminate(false).await?;
    let mut sent = Vec::with_capacity(args.messages);
    for i in 1..=args.messages {
        let body = format!("offline-{}", i);
        group
            .send(&body)
            .await
            .with_context(|| format!("Failed to send message {}", i))?;
        sent.push(body);
    }

    receiver.initialize().await.context("Failed to reconnect")?;
    receiver.sync_all().await?;
    let conversation = receiver
        .conversation(group.id())
        .await?
        .context("Group not visible after reconnect")?;
    conversation.sync().await?;
    let recovered: Vec<String> = conversation
        .messages()
        .await?
        .iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect();

    let check = assert_recovered_messages(receiver.name(), &sent, &recovered);
    manager.terminate_all(true).await?;

    Ok(OfflineReport {
        passed: check.passed,
        worker: receiver.name().to_string(),
        sent: sent.len(),
        recovered: recovered.len(),
        check,
    })
}
