//! Epoch churn and fork detection scenarios.

use super::setup;
use crate::assertions::{assert_membership_converged, assert_no_forks};
use crate::error::ForkError;
use crate::forks::verify_epoch_change;
use fanout_core::EpochTracker;

// ========================================================================
// Convergence
// ========================================================================

/// Six members, one churned per epoch, three epochs.
#[tokio::test]
async fn six_workers_converge_after_three_epochs() {
    let (network, manager) = setup(6, "six-epochs").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let before = network.conversation_epoch(group.id()).unwrap();

    let report = verify_epoch_change(&manager, group.id(), 3).await.unwrap();

    assert_eq!(report.rounds.len(), 3);
    assert_eq!(report.snapshots.len(), 6);
    assert!(report.is_consistent());
    assert!(report.snapshots.iter().all(|s| !s.maybe_forked));
    assert!(assert_membership_converged(&report.snapshots).passed);
    assert_eq!(
        report.snapshots[0].member_inbox_ids,
        manager.inbox_ids().into_iter().collect()
    );
    assert!(network.conversation_epoch(group.id()).unwrap() >= before + 6);
    assert!(assert_no_forks(&manager.check_forks().await).passed);
}

#[tokio::test]
async fn epochs_never_go_backwards_across_polls() {
    let (_network, manager) = setup(4, "monotonic").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let mut tracker = EpochTracker::new();

    for _ in 0..3 {
        let report = verify_epoch_change(&manager, group.id(), 1).await.unwrap();
        assert!(report.regressions.is_empty());
        for snapshot in &report.snapshots {
            tracker
                .record(&snapshot.participant, group.id(), snapshot.epoch)
                .unwrap();
        }
    }

    assert!(tracker.regressions().is_empty());
    let last = tracker.last_epoch("alice", group.id()).unwrap();
    assert!(last >= 6);
}

// ========================================================================
// Fork probes
// ========================================================================

#[tokio::test]
async fn check_forks_is_idempotent() {
    let (network, manager) = setup(3, "idempotent").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();

    let first = manager.check_forks().await;
    let second = manager.check_forks().await;
    assert_eq!(first, second);
    assert!(!first.has_forks());

    let bob = manager.must_get("bob").unwrap();
    network.inject_fork(bob.db_path(), group.id(), true).unwrap();

    let first = manager.check_forks_for_group(group.id()).await;
    let second = manager.check_forks_for_group(group.id()).await;
    assert_eq!(first, second);
    assert!(!assert_no_forks(&first).passed);
    assert_eq!(first.forked[0].worker, "bob");
}

#[tokio::test]
async fn persistent_fork_fails_the_epoch_check() {
    let (network, manager) = setup(3, "persistent").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let charlie = manager.must_get("charlie").unwrap();
    network.inject_fork(charlie.db_path(), group.id(), true).unwrap();

    let err = verify_epoch_change(&manager, group.id(), 2).await.unwrap_err();

    match err {
        ForkError::UnresolvedFork {
            group: failed,
            participants,
            ..
        } => {
            assert_eq!(&failed, group.id());
            assert!(participants.contains(&"charlie".to_string()));
        }
        other => panic!("expected an unresolved fork, got {other:?}"),
    }
}

#[tokio::test]
async fn healable_fork_is_repaired_during_churn() {
    let (network, manager) = setup(4, "healable").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let dave = manager.get_all()[3].clone();
    network.inject_fork(dave.db_path(), group.id(), false).unwrap();
    assert!(manager.check_forks_for_group(group.id()).await.has_forks());

    let report = verify_epoch_change(&manager, group.id(), 1).await.unwrap();

    assert!(report.is_consistent());
    assert!(!manager.check_forks_for_group(group.id()).await.has_forks());
}
