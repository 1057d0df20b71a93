//! Delivery and ordering statistics for stream verification.
//!
//! Scoring is a pure function over what was sent and what each receiver
//! observed. Keys identify events (a tagged message body, an added inbox id,
//! a conversation id); timestamps are milliseconds from a shared origin
//! chosen by the caller.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// An event the acting worker triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    /// Identifying key
    pub key: String,
    /// When the trigger was issued
    pub sent_at_ms: u64,
}

/// An event a receiver observed on its subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    /// Identifying key
    pub key: String,
    /// When the receiver saw it
    pub observed_at_ms: u64,
}

/// Everything one receiver observed during a verification window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverObservation {
    /// Receiver label (worker name)
    pub receiver: String,
    /// Observed events in arrival order
    pub events: Vec<ObservedEvent>,
}

impl ReceiverObservation {
    /// A receiver that observed nothing (timed out, or never subscribed).
    pub fn empty(receiver: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            events: Vec::new(),
        }
    }
}

/// Per-receiver breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiverStats {
    /// Receiver label
    pub receiver: String,
    /// Distinct expected events observed
    pub received: usize,
    /// Observed sequence preserves the sent order
    pub in_order: bool,
}

/// Aggregate statistics for one verification call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    /// Events expected per receiver
    pub expected_per_receiver: usize,
    /// `expected_per_receiver × receivers`
    pub expected_total: usize,
    /// Distinct expected events observed, summed over receivers
    pub received_total: usize,
    /// `received_total / expected_total × 100`
    pub reception_percentage: f64,
    /// Share of receivers whose observations are in order, in percent
    pub order_percentage: f64,
    /// Mean delay between send and observation
    pub average_event_timing_ms: f64,
    /// Every individual delay that went into the mean
    pub event_timings_ms: Vec<u64>,
    /// Per-receiver breakdown, in input order
    pub receivers: Vec<ReceiverStats>,
}

impl DeliveryStats {
    /// Every expected event reached every receiver.
    pub fn all_received(&self) -> bool {
        self.received_total >= self.expected_total
    }

    /// Reception reached the tolerance threshold (percent).
    pub fn almost_all_received(&self, threshold: f64) -> bool {
        self.reception_percentage >= threshold
    }
}

/// Whether `observed` appears in `sent` in the same relative order.
///
/// Gaps are allowed: `[e2, e4]` is order-preserving against `[e1, e2, e3, e4]`.
pub fn is_order_preserving<S: AsRef<str>, T: AsRef<str>>(observed: &[S], sent: &[T]) -> bool {
    let mut cursor = sent.iter();
    observed
        .iter()
        .all(|want| cursor.any(|have| have.as_ref() == want.as_ref()))
}

/// Score observations against the sent sequence.
///
/// Only observations whose key is in `sent` count, and each key counts once
/// per receiver. A receiver that saw nothing while events were expected is
/// not counted as in order. With no receivers the result is vacuously
/// 100/100.
pub fn score(sent: &[SentEvent], observations: &[ReceiverObservation]) -> DeliveryStats {
    let sent_at: HashMap<&str, u64> = sent
        .iter()
        .map(|e| (e.key.as_str(), e.sent_at_ms))
        .collect();
    let sent_keys: Vec<&str> = sent.iter().map(|e| e.key.as_str()).collect();
    let expected_per_receiver = sent_at.len();
    let expected_total = expected_per_receiver * observations.len();

    let mut received_total = 0;
    let mut in_order_count = 0;
    let mut event_timings_ms = Vec::new();
    let mut receivers = Vec::with_capacity(observations.len());

    for observation in observations {
        let mut seen = HashSet::new();
        let mut relevant = Vec::new();

        for event in &observation.events {
            let Some(&sent_ms) = sent_at.get(event.key.as_str()) else {
                continue;
            };
            if !seen.insert(event.key.as_str()) {
                continue;
            }
            relevant.push(event.key.as_str());
            event_timings_ms.push(event.observed_at_ms.saturating_sub(sent_ms));
        }

        let in_order = if relevant.is_empty() {
            expected_per_receiver == 0
        } else {
            is_order_preserving(relevant.as_slice(), sent_keys.as_slice())
        };
        if in_order {
            in_order_count += 1;
        }
        received_total += relevant.len();
        receivers.push(ReceiverStats {
            receiver: observation.receiver.clone(),
            received: relevant.len(),
            in_order,
        });
    }

    let reception_percentage = if expected_total == 0 {
        100.0
    } else {
        received_total as f64 / expected_total as f64 * 100.0
    };
    let order_percentage = if observations.is_empty() {
        100.0
    } else {
        in_order_count as f64 / observations.len() as f64 * 100.0
    };
    let average_event_timing_ms = if event_timings_ms.is_empty() {
        0.0
    } else {
        event_timings_ms.iter().sum::<u64>() as f64 / event_timings_ms.len() as f64
    };

    DeliveryStats {
        expected_per_receiver,
        expected_total,
        received_total,
        reception_percentage,
        order_percentage,
        average_event_timing_ms,
        event_timings_ms,
        receivers,
    }
}
