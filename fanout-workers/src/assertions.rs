//! Assertion helpers for harness scenarios.
//!
//! These are pure functions that check verification results, fork scans and
//! recovered histories after a scenario completes. They take state as input
//! and return pass/fail.

use serde::Serialize;
use std::collections::BTreeSet;

use fanout_core::GroupEpochSnapshot;

use crate::manager::ForkScan;
use crate::verify::VerificationResult;

/// Result of an assertion check.
#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    /// Whether the assertion passed
    pub passed: bool,
    /// Description of what was checked
    pub description: String,
    /// Details on failure
    pub failure_details: Option<String>,
}

impl AssertionResult {
    /// Create a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.into(),
            failure_details: None,
        }
    }

    /// Create a failing result.
    pub fn fail(description: &str, details: &str) -> Self {
        Self {
            passed: false,
            description: description.into(),
            failure_details: Some(details.into()),
        }
    }
}

/// Assert that reception reached at least `minimum` percent.
pub fn assert_reception(result: &VerificationResult, minimum: f64) -> AssertionResult {
    let description = format!(
        "{} stream reception >= {}% across {} receivers",
        result.kind,
        minimum,
        result.receiver_count
    );
    let observed = result.reception_percentage();
    if observed >= minimum {
        AssertionResult::pass(&description)
    } else {
        let short: Vec<String> = result
            .stats
            .receivers
            .iter()
            .filter(|r| r.received < result.stats.expected_per_receiver)
            .map(|r| format!("{} ({}/{})", r.receiver, r.received, result.stats.expected_per_receiver))
            .collect();
        AssertionResult::fail(
            &description,
            &format!("reception was {:.1}%, short: {}", observed, short.join(", ")),
        )
    }
}

/// Assert that every receiver observed events in send order.
pub fn assert_order(result: &VerificationResult) -> AssertionResult {
    let description = format!("{} stream order preserved", result.kind);
    let out_of_order: Vec<&str> = result
        .stats
        .receivers
        .iter()
        .filter(|r| !r.in_order)
        .map(|r| r.receiver.as_str())
        .collect();

    if out_of_order.is_empty() {
        AssertionResult::pass(&description)
    } else {
        AssertionResult::fail(
            &description,
            &format!("out of order or empty on: {}", out_of_order.join(", ")),
        )
    }
}

/// Assert that a worker's recovered history holds exactly the sent texts.
///
/// Order is ignored; duplicates collapse.
pub fn assert_recovered_messages(
    worker: &str,
    sent: &[String],
    recovered: &[String],
) -> AssertionResult {
    let description = format!("{} recovered all {} messages", worker, sent.len());
    let expected: BTreeSet<&str> = sent.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = recovered
        .iter()
        .map(String::as_str)
        .filter(|text| expected.contains(text))
        .collect();

    let missing: Vec<&str> = expected.difference(&actual).copied().collect();
    if missing.is_empty() {
        AssertionResult::pass(&description)
    } else {
        AssertionResult::fail(
            &description,
            &format!("missing {} messages: {:?}", missing.len(), missing),
        )
    }
}

/// Assert that every snapshot agrees on epoch and member set.
pub fn assert_membership_converged(snapshots: &[GroupEpochSnapshot]) -> AssertionResult {
    let description = format!("{} participants converged", snapshots.len());
    let Some(first) = snapshots.first() else {
        return AssertionResult::pass(&description);
    };

    let mut differing = Vec::new();
    for snapshot in snapshots {
        if snapshot.epoch != first.epoch || snapshot.member_inbox_ids != first.member_inbox_ids {
            differing.push(format!(
                "{} (epoch {}, {} members)",
                snapshot.participant,
                snapshot.epoch,
                snapshot.member_inbox_ids.len()
            ));
        }
    }

    if differing.is_empty() {
        AssertionResult::pass(&description)
    } else {
        AssertionResult::fail(
            &description,
            &format!(
                "reference {} at epoch {}; differing: {}",
                first.participant,
                first.epoch,
                differing.join(", ")
            ),
        )
    }
}

/// Assert that a fork scan found nothing.
pub fn assert_no_forks(scan: &ForkScan) -> AssertionResult {
    let description = format!("no forks across {} group views", scan.checked);
    if !scan.has_forks() {
        return AssertionResult::pass(&description);
    }
    let flagged: Vec<String> = scan
        .forked
        .iter()
        .map(|f| format!("{} in {} at epoch {}", f.worker, f.group, f.epoch))
        .collect();
    AssertionResult::fail(&description, &flagged.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ForkFlag;
    use fanout_core::{DeliveryStats, ReceiverStats};
    use fanout_types::{ConversationId, InboxId, StreamKind};

    fn result(receivers: &[(&str, usize, bool)], expected: usize) -> VerificationResult {
        let received_total: usize = receivers.iter().map(|r| r.1).sum();
        let expected_total = expected * receivers.len();
        let reception = if expected_total == 0 {
            100.0
        } else {
            received_total as f64 * 100.0 / expected_total as f64
        };
        VerificationResult {
            kind: StreamKind::Message,
            triggered: expected,
            receiver_count: receivers.len(),
            almost_all_threshold: 95.0,
            all_received: received_total == expected_total,
            almost_all_received: reception >= 95.0,
            stats: DeliveryStats {
                expected_per_receiver: expected,
                expected_total,
                received_total,
                reception_percentage: reception,
                order_percentage: 100.0,
                average_event_timing_ms: 0.0,
                event_timings_ms: Vec::new(),
                receivers: receivers
                    .iter()
                    .map(|(name, received, in_order)| ReceiverStats {
                        receiver: name.to_string(),
                        received: *received,
                        in_order: *in_order,
                    })
                    .collect(),
            },
        }
    }

    fn snapshot(participant: &str, epoch: u64, members: &[&str]) -> GroupEpochSnapshot {
        GroupEpochSnapshot {
            participant: participant.to_string(),
            epoch,
            member_inbox_ids: members.iter().map(|m| InboxId::new(*m)).collect(),
            maybe_forked: false,
        }
    }

    // ===========================================
    // AssertionResult Tests
    // ===========================================

    #[test]
    fn test_assertion_result_pass() {
        let result = AssertionResult::pass("test passed");
        assert!(result.passed);
        assert!(result.failure_details.is_none());
    }

    #[test]
    fn test_assertion_result_fail() {
        let result = AssertionResult::fail("test failed", "reason");
        assert!(!result.passed);
        assert_eq!(result.failure_details, Some("reason".to_string()));
    }

    // ===========================================
    // Stream Assertions
    // ===========================================

    #[test]
    fn test_reception_passes_at_threshold() {
        let result = result(&[("bob", 10, true), ("carol", 9, true)], 10);
        assert!(assert_reception(&result, 95.0).passed);
    }

    #[test]
    fn test_reception_names_short_receivers() {
        let result = result(&[("bob", 10, true), ("carol", 2, true)], 10);
        let check = assert_reception(&result, 95.0);
        assert!(!check.passed);
        let details = check.failure_details.unwrap();
        assert!(details.contains("carol (2/10)"));
        assert!(!details.contains("bob"));
    }

    #[test]
    fn test_order_lists_failing_receivers() {
        let mixed = result(&[("bob", 10, true), ("carol", 10, false)], 10);
        let check = assert_order(&mixed);
        assert!(!check.passed);
        assert!(check.failure_details.unwrap().contains("carol"));

        let ordered = result(&[("bob", 3, true)], 3);
        assert!(assert_order(&ordered).passed);
    }

    // ===========================================
    // Recovery Assertions
    // ===========================================

    #[test]
    fn test_recovered_ignores_order_and_extras() {
        let sent: Vec<String> = (1..=3).map(|i| format!("m{}", i)).collect();
        let recovered = vec![
            "group ready".to_string(),
            "m3".to_string(),
            "m1".to_string(),
            "m2".to_string(),
        ];
        assert!(assert_recovered_messages("bob", &sent, &recovered).passed);
    }

    #[test]
    fn test_recovered_reports_missing() {
        let sent: Vec<String> = (1..=3).map(|i| format!("m{}", i)).collect();
        let recovered = vec!["m1".to_string()];
        let check = assert_recovered_messages("bob", &sent, &recovered);
        assert!(!check.passed);
        assert!(check.failure_details.unwrap().contains("missing 2"));
    }

    // ===========================================
    // Membership / Fork Assertions
    // ===========================================

    #[test]
    fn test_membership_converged() {
        let snapshots = vec![
            snapshot("alice", 4, &["a", "b"]),
            snapshot("bob", 4, &["a", "b"]),
        ];
        assert!(assert_membership_converged(&snapshots).passed);
        assert!(assert_membership_converged(&[]).passed);
    }

    #[test]
    fn test_membership_divergence_reported() {
        let snapshots = vec![
            snapshot("alice", 4, &["a", "b"]),
            snapshot("bob", 3, &["a", "b"]),
            snapshot("carol", 4, &["a"]),
        ];
        let check = assert_membership_converged(&snapshots);
        assert!(!check.passed);
        let details = check.failure_details.unwrap();
        assert!(details.contains("bob (epoch 3"));
        assert!(details.contains("carol"));
    }

    #[test]
    fn test_no_forks() {
        let mut scan = ForkScan {
            checked: 6,
            forked: Vec::new(),
        };
        assert!(assert_no_forks(&scan).passed);

        scan.forked.push(ForkFlag {
            worker: "bob".to_string(),
            group: ConversationId::new("g1"),
            epoch: 7,
        });
        let check = assert_no_forks(&scan);
        assert!(!check.passed);
        assert!(check.failure_details.unwrap().contains("bob in g1 at epoch 7"));
    }
}
