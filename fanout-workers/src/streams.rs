//! Per-receiver event collection.
//!
//! A collector drains one worker's observed-event channel until it has seen
//! the expected number of distinct keys or the deadline passes, whichever
//! comes first. Collectors for different receivers are independent.

use std::collections::HashSet;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;

use fanout_core::{ObservedEvent, ReceiverObservation};
use fanout_types::StreamEvent;

use crate::worker::ObservedStreamEvent;

/// Milliseconds from `origin` to `at`, zero if `at` is earlier.
pub fn millis_since(origin: Instant, at: Instant) -> u64 {
    at.saturating_duration_since(origin).as_millis() as u64
}

struct Collected {
    origin: Instant,
    seen: HashSet<String>,
    events: Vec<ObservedEvent>,
}

impl Collected {
    fn push(&mut self, key: String, received_at: Instant) {
        if self.seen.insert(key.clone()) {
            self.events.push(ObservedEvent {
                key,
                observed_at_ms: millis_since(self.origin, received_at),
            });
        }
    }
}

/// Collect keyed events from `rx` for one receiver.
///
/// `key_of` maps an event to its key, or `None` for events that do not
/// belong to this verification. Each key counts once. Events already
/// buffered when the deadline passes are still taken.
pub async fn collect<F>(
    receiver: &str,
    mut rx: broadcast::Receiver<ObservedStreamEvent>,
    origin: Instant,
    deadline: Instant,
    expected: usize,
    key_of: F,
) -> ReceiverObservation
where
    F: Fn(&StreamEvent) -> Option<String>,
{
    let mut collected = Collected {
        origin,
        seen: HashSet::new(),
        events: Vec::new(),
    };

    while collected.seen.len() < expected {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(observed)) => {
                if let Some(key) = key_of(&observed.event) {
                    collected.push(key, observed.received_at);
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(receiver, skipped, "collector fell behind, events skipped");
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                loop {
                    match rx.try_recv() {
                        Ok(observed) => {
                            if let Some(key) = key_of(&observed.event) {
                                collected.push(key, observed.received_at);
                            }
                        }
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                if collected.seen.len() < expected {
                    tracing::debug!(
                        receiver,
                        received = collected.seen.len(),
                        expected,
                        "collection deadline passed"
                    );
                }
                break;
            }
        }
    }

    ReceiverObservation {
        receiver: receiver.to_string(),
        events: collected.events,
    }
}
