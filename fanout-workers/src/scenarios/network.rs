//! Network fault scenarios.
//!
//! Faults are measured, never raised: a worker behind a lossy link shows up
//! as reduced reception while its peers are unaffected.

use super::{options, quick};
use crate::config::HarnessConfig;
use crate::manager::get_workers;
use crate::verify::verify_message_stream;
use fanout_client::MemoryNetwork;
use fanout_types::{ChaosLevel, NetworkConditions, StreamKind};
use std::time::Duration;

// ========================================================================
// Per-worker profiles
// ========================================================================

/// Bob's link drops everything; Charlie still gets every message.
#[tokio::test]
async fn total_loss_on_one_receiver_halves_reception() {
    let network = MemoryNetwork::new();
    let manager = get_workers(
        3,
        "loss",
        options(&network).with_stream(StreamKind::Message),
    )
    .await
    .unwrap();
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    manager
        .set_worker_network_conditions("bob", NetworkConditions::none().packet_loss(1.0))
        .unwrap();

    let receivers = manager.get_all_but_creator();
    let result = verify_message_stream(&group, &receivers, 10, &quick(500)).await;

    assert_eq!(result.triggered, 10);
    assert!(result.reception_percentage() <= 50.0);
    assert_eq!(result.received_by("bob"), Some(0));
    assert_eq!(result.received_by("charlie"), Some(10));
    assert!(!result.all_received);
    assert!(manager.simulator().stats("bob").unwrap().dropped >= 10);

    manager.clear_worker_network_conditions("bob").unwrap();
    let healed = verify_message_stream(&group, &receivers, 5, &quick(2_000)).await;
    assert!(healed.all_received);
}

#[tokio::test]
async fn inbound_latency_shows_in_event_timing() {
    let network = MemoryNetwork::new();
    let manager = get_workers(
        3,
        "latency",
        options(&network).with_stream(StreamKind::Message),
    )
    .await
    .unwrap();
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    manager
        .set_worker_network_conditions("charlie", NetworkConditions::none().latency(100))
        .unwrap();

    let receivers = manager.get_all_but_creator();
    let result = verify_message_stream(&group, &receivers, 3, &quick(5_000)).await;

    assert!(result.all_received);
    assert!(result.average_event_timing_ms() >= 50.0);
}

#[tokio::test]
async fn manager_wide_profile_applies_to_every_worker() {
    let network = MemoryNetwork::new();
    let manager = get_workers(
        3,
        "wide",
        options(&network).with_network(NetworkConditions::none().latency(5)),
    )
    .await
    .unwrap();

    assert_eq!(manager.simulator().active_profiles().len(), 3);
    for summary in manager.describe() {
        assert!(summary.conditions.contains("latency=5ms"));
    }
}

#[tokio::test]
async fn invalid_manager_profile_is_rejected_up_front() {
    let network = MemoryNetwork::new();
    let err = get_workers(
        2,
        "invalid",
        options(&network).with_network(NetworkConditions::none().packet_loss(2.0)),
    )
    .await
    .unwrap_err();
    assert!(!err.is_provisioning());
    assert_eq!(network.subscriber_count(), 0);
}

// ========================================================================
// Chaos schedule
// ========================================================================

#[tokio::test]
async fn configured_chaos_runs_until_terminate() {
    let network = MemoryNetwork::new();
    let mut config = HarnessConfig::default();
    config.network.seed = Some(42);
    config.network.chaos = Some(ChaosLevel::Low);
    config.network.chaos_interval_ms = Some(10);

    let manager = get_workers(2, "chaos", options(&network).with_config(config))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(manager.simulator().active_profiles().len(), 2);

    manager.terminate_all(false).await.unwrap();
    assert!(manager.simulator().active_profiles().is_empty());
}
