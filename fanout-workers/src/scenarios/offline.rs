//! Offline and recovery scenarios.
//!
//! Traffic missed while a worker is away stays in the group log; after the
//! worker reconnects and syncs, its history must hold every missed message.

use super::setup;
use crate::assertions::assert_recovered_messages;
use crate::worker::Worker;
use fanout_client::Conversation;
use fanout_types::{ConversationId, NetworkConditions};
use std::sync::Arc;

async fn send_batch(
    conversation: &Arc<dyn Conversation>,
    prefix: &str,
    count: usize,
) -> Vec<String> {
    let mut sent = Vec::with_capacity(count);
    for i in 1..=count {
        let body = format!("{}-{}", prefix, i);
        conversation.send(&body).await.unwrap();
        sent.push(body);
    }
    sent
}

async fn history(worker: &Worker, group: &ConversationId) -> Vec<String> {
    worker.sync_all().await.unwrap();
    let conversation = worker.conversation(group).await.unwrap().unwrap();
    conversation.sync().await.unwrap();
    conversation
        .messages()
        .await
        .unwrap()
        .iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect()
}

// ========================================================================
// Terminate and reconnect
// ========================================================================

#[tokio::test]
async fn terminated_worker_recovers_missed_messages() {
    let (_network, manager) = setup(3, "offline").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let bob = manager.must_get("bob").unwrap();

    bob.terminate(false).await.unwrap();
    assert!(!bob.is_initialized());

    let sent = send_batch(&group, "offline", 10).await;

    bob.initialize().await.unwrap();
    let recovered = history(&bob, group.id()).await;

    let check = assert_recovered_messages(bob.name(), &sent, &recovered);
    assert!(check.passed, "{:?}", check.failure_details);
}

#[tokio::test]
async fn partitioned_worker_recovers_after_heal() {
    let (_network, manager) = setup(3, "partition").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let charlie = manager.must_get("charlie").unwrap();

    manager
        .set_worker_network_conditions("charlie", NetworkConditions::none().packet_loss(1.0))
        .unwrap();
    let sent = send_batch(&group, "partition", 10).await;
    assert!(charlie.sync_all().await.is_err());

    manager.clear_worker_network_conditions("charlie").unwrap();
    let recovered = history(&charlie, group.id()).await;

    assert!(assert_recovered_messages(charlie.name(), &sent, &recovered).passed);
}

#[tokio::test]
async fn reinstalled_worker_sees_full_history() {
    let (network, manager) = setup(2, "reinstall").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let bob = manager.must_get("bob").unwrap();
    let sent = send_batch(&group, "before", 3).await;

    let previous = bob.installation_id();
    bob.reinstall().await.unwrap();
    assert_ne!(bob.installation_id(), previous);
    assert_eq!(network.installations_of(bob.inbox_id()).len(), 1);

    let recovered = history(&bob, group.id()).await;
    assert!(assert_recovered_messages(bob.name(), &sent, &recovered).passed);
}

#[tokio::test]
async fn missing_messages_are_reported() {
    let (_network, manager) = setup(2, "missing").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let bob = manager.must_get("bob").unwrap();
    let mut sent = send_batch(&group, "real", 2).await;
    sent.push("never-sent".to_string());

    let recovered = history(&bob, group.id()).await;
    let check = assert_recovered_messages(bob.name(), &sent, &recovered);

    assert!(!check.passed);
    assert!(check.failure_details.unwrap().contains("never-sent"));
}
