//! Stream delivery scenarios.
//!
//! Fault-free runs must reach every receiver in send order; the boundary
//! cases (no events, no receivers, zero timeout) pin down the scoring rules.

use super::{quick, setup};
use crate::assertions::{assert_order, assert_reception};
use crate::verify::{
    verify_consent_stream, verify_conversation_stream, verify_group_consent_stream,
    verify_membership_stream, verify_message_stream, verify_metadata_stream, VerifyOptions,
};
use fanout_types::{NetworkConditions, StreamKind};
use std::time::Duration;

// ========================================================================
// Messages
// ========================================================================

/// One sender, two receivers, ten messages, no faults.
#[tokio::test]
async fn three_workers_receive_every_message_in_order() {
    let (_network, manager) = setup(3, "three-workers").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();

    let result = verify_message_stream(&group, &receivers, 10, &VerifyOptions::default()).await;

    assert_eq!(result.triggered, 10);
    assert_eq!(result.reception_percentage(), 100.0);
    assert_eq!(result.order_percentage(), 100.0);
    assert!(result.all_received);
    assert!(result.almost_all_received);
    assert!(assert_reception(&result, 100.0).passed);
    assert!(assert_order(&result).passed);
    assert_eq!(result.received_by("bob"), Some(10));
    assert_eq!(result.received_by("charlie"), Some(10));

    manager.terminate_all(true).await.unwrap();
}

#[tokio::test]
async fn no_messages_scores_full_marks() {
    let (_network, manager) = setup(2, "no-messages").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();

    let result = verify_message_stream(&group, &receivers, 0, &quick(50)).await;

    assert_eq!(result.triggered, 0);
    assert_eq!(result.reception_percentage(), 100.0);
    assert_eq!(result.order_percentage(), 100.0);
    assert!(result.all_received);
}

#[tokio::test]
async fn no_receivers_scores_full_marks() {
    let (_network, manager) = setup(1, "no-receivers").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();

    let result = verify_message_stream(&group, &[], 5, &quick(50)).await;

    assert_eq!(result.receiver_count, 0);
    assert_eq!(result.triggered, 5);
    assert_eq!(result.reception_percentage(), 100.0);
    assert_eq!(result.order_percentage(), 100.0);
}

#[tokio::test]
async fn zero_timeout_cannot_see_unbuffered_events() {
    let (_network, manager) = setup(2, "zero-timeout").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();

    let options = VerifyOptions::default().with_timeout(Duration::ZERO);
    let result = verify_message_stream(&group, &receivers, 3, &options).await;

    assert!(result.reception_percentage() < 100.0);
    assert!(!result.all_received);
}

#[tokio::test]
async fn threshold_is_taken_from_options() {
    let (_network, manager) = setup(3, "threshold").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();
    manager
        .set_worker_network_conditions("charlie", NetworkConditions::none().packet_loss(1.0))
        .unwrap();

    let strict = quick(200).with_threshold(90.0);
    let lenient = quick(200).with_threshold(50.0);
    let strict_result = verify_message_stream(&group, &receivers, 4, &strict).await;
    let lenient_result = verify_message_stream(&group, &receivers, 4, &lenient).await;

    assert!(!strict_result.almost_all_received);
    assert!(lenient_result.almost_all_received);
    assert_eq!(lenient_result.almost_all_threshold, 50.0);
}

// ========================================================================
// Group updates
// ========================================================================

#[tokio::test]
async fn membership_commit_reaches_members() {
    let (network, manager) = setup(4, "membership").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();
    let newcomer = network.register_inbox();

    let result =
        verify_membership_stream(&group, &receivers, std::slice::from_ref(&newcomer), &quick(2_000))
            .await;

    assert_eq!(result.kind, StreamKind::GroupUpdated);
    assert_eq!(result.triggered, 1);
    assert!(result.all_received);
    assert!(network.members_of(group.id()).unwrap().contains(&newcomer));
}

#[tokio::test]
async fn metadata_updates_arrive_in_order() {
    let (_network, manager) = setup(3, "metadata").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();

    let result = verify_metadata_stream(&group, &receivers, 3, &quick(2_000)).await;

    assert_eq!(result.triggered, 3);
    assert_eq!(result.reception_percentage(), 100.0);
    assert_eq!(result.order_percentage(), 100.0);
    assert_eq!(group.name().await.unwrap(), "New name-3-scenario");
}

// ========================================================================
// Conversations and consent
// ========================================================================

#[tokio::test]
async fn new_conversation_is_announced() {
    let (_network, manager) = setup(3, "conversations").await;
    let initiator = manager.creator().unwrap();
    let receivers = manager.get_all_but_creator();

    let result = verify_conversation_stream(&initiator, &receivers, &quick(2_000)).await;

    assert_eq!(result.kind, StreamKind::Conversation);
    assert!(result.all_received);
}

#[tokio::test]
async fn consent_change_reaches_own_stream() {
    let (_network, manager) = setup(2, "consent").await;
    let initiator = manager.creator().unwrap();
    let target = manager.receiver().unwrap().inbox_id().clone();

    let result = verify_consent_stream(&initiator, &target, &quick(2_000)).await;

    assert_eq!(result.kind, StreamKind::Consent);
    assert_eq!(result.receiver_count, 1);
    assert!(result.all_received);
}

#[tokio::test]
async fn group_consent_toggles_are_seen() {
    let (_network, manager) = setup(3, "group-consent").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator();

    let result = verify_group_consent_stream(group.id(), &receivers, &quick(2_000)).await;

    assert_eq!(result.receiver_count, 2);
    assert!(result.all_received);
}
