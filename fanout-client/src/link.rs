//! Per-worker network link with fault injection.
//!
//! Every call a protocol client makes, and every event it delivers to a
//! subscription, passes through the worker's [`NetworkLink`]. The link
//! applies the current [`NetworkConditions`]:
//!
//! - latency ± uniform jitter on every call and delivery
//! - extra delay of `payload bits / bandwidth` when a cap is set
//! - packet loss: the call fails with [`LinkError::PacketLost`] after its
//!   delay, and is not retried here
//! - disconnect windows: a call may open a window of
//!   `disconnect_duration_ms` during which pending and new calls fail
//!
//! Conditions are replaced atomically (last writer wins) and only change
//! timing and availability, never protocol state.

use fanout_types::NetworkConditions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Simulated network failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The call was lost in transit.
    #[error("packet lost")]
    PacketLost,

    /// The worker is inside a disconnect window.
    #[error("disconnected for another {remaining_ms}ms")]
    Disconnected {
        /// Time left in the window
        remaining_ms: u64,
    },
}

/// Counters for what the link did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Outbound calls attempted
    pub calls: u64,
    /// Outbound calls lost
    pub lost: u64,
    /// Outbound calls rejected by a disconnect window
    pub rejected: u64,
    /// Disconnect windows opened
    pub disconnects: u64,
    /// Inbound events delivered
    pub delivered: u64,
    /// Inbound events dropped
    pub dropped: u64,
}

#[derive(Debug)]
struct LinkState {
    conditions: NetworkConditions,
    rng: StdRng,
    offline_until: Option<Instant>,
    stats: LinkStats,
}

enum Plan {
    Fail(LinkError),
    Proceed { delay: Duration, lose: bool },
}

/// Shared handle to one worker's link. Clones share state.
#[derive(Debug, Clone)]
pub struct NetworkLink {
    label: Arc<str>,
    state: Arc<Mutex<LinkState>>,
}

impl NetworkLink {
    /// Create an unaffected link seeded from entropy.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_rng(label, StdRng::from_entropy())
    }

    /// Create an unaffected link with a fixed seed, for reproducible runs.
    pub fn with_seed(label: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(label, StdRng::seed_from_u64(seed))
    }

    fn with_rng(label: impl Into<String>, rng: StdRng) -> Self {
        let label: String = label.into();
        Self {
            label: label.into(),
            state: Arc::new(Mutex::new(LinkState {
                conditions: NetworkConditions::none(),
                rng,
                offline_until: None,
                stats: LinkStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Label used in logs (the worker name).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replace the current profile.
    pub fn set_conditions(&self, conditions: NetworkConditions) {
        tracing::debug!(link = %self.label, %conditions, "network conditions set");
        self.lock().conditions = conditions;
    }

    /// Reset to no faults and close any open disconnect window.
    pub fn clear_conditions(&self) {
        let mut state = self.lock();
        state.conditions = NetworkConditions::none();
        state.offline_until = None;
        tracing::debug!(link = %self.label, "network conditions cleared");
    }

    /// Current profile.
    pub fn conditions(&self) -> NetworkConditions {
        self.lock().conditions.clone()
    }

    /// True while a disconnect window is open.
    pub fn is_disconnected(&self) -> bool {
        self.lock()
            .offline_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> LinkStats {
        self.lock().stats
    }

    /// Gate an outbound call carrying `payload_len` bytes.
    pub async fn transmit(&self, payload_len: usize) -> Result<(), LinkError> {
        let (delay, lose) = match self.plan(payload_len, true) {
            Plan::Fail(err) => return Err(err),
            Plan::Proceed { delay, lose } => (delay, lose),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(remaining) = remaining_window(state.offline_until) {
            state.stats.rejected += 1;
            return Err(LinkError::Disconnected {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
        if lose {
            state.stats.lost += 1;
            tracing::trace!(link = %self.label, "call lost");
            return Err(LinkError::PacketLost);
        }
        Ok(())
    }

    /// Gate an inbound event. Returns `false` if the event is dropped.
    ///
    /// Inbound events never open a disconnect window, but are dropped while
    /// one is open.
    pub async fn deliver(&self, payload_len: usize) -> bool {
        let (delay, lose) = match self.plan(payload_len, false) {
            Plan::Fail(_) => {
                self.lock().stats.dropped += 1;
                return false;
            }
            Plan::Proceed { delay, lose } => (delay, lose),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if lose || remaining_window(state.offline_until).is_some() {
            state.stats.dropped += 1;
            return false;
        }
        state.stats.delivered += 1;
        true
    }

    fn plan(&self, payload_len: usize, outbound: bool) -> Plan {
        let mut guard = self.lock();
        let state = &mut *guard;
        if outbound {
            state.stats.calls += 1;
        }

        if let Some(remaining) = remaining_window(state.offline_until) {
            if outbound {
                state.stats.rejected += 1;
            }
            return Plan::Fail(LinkError::Disconnected {
                remaining_ms: remaining.as_millis() as u64,
            });
        }
        if state.offline_until.take().is_some() {
            tracing::info!(link = %self.label, "disconnect window elapsed, link recovered");
        }

        let conditions = &state.conditions;
        if conditions.is_unaffected() {
            return Plan::Proceed {
                delay: Duration::ZERO,
                lose: false,
            };
        }

        if outbound && roll(&mut state.rng, conditions.disconnect_probability) {
            let window = Duration::from_millis(conditions.disconnect_duration_ms.unwrap_or(0));
            state.offline_until = Some(Instant::now() + window);
            state.stats.disconnects += 1;
            state.stats.rejected += 1;
            tracing::warn!(
                link = %self.label,
                "disconnected for {}ms",
                window.as_millis()
            );
            return Plan::Fail(LinkError::Disconnected {
                remaining_ms: window.as_millis() as u64,
            });
        }

        let mut delay_ms = conditions.latency_ms.unwrap_or(0) as i64;
        if let Some(jitter) = conditions.jitter_ms.filter(|j| *j > 0) {
            let jitter = jitter as i64;
            delay_ms += state.rng.gen_range(-jitter..=jitter);
        }
        if let Some(kbps) = conditions.bandwidth_limit_kbps.filter(|k| *k > 0) {
            // kbit/s is bits per millisecond
            delay_ms += (payload_len as u64 * 8 / kbps) as i64;
        }
        let lose = roll(&mut state.rng, conditions.packet_loss_rate);

        Plan::Proceed {
            delay: Duration::from_millis(delay_ms.max(0) as u64),
            lose,
        }
    }
}

fn remaining_window(offline_until: Option<Instant>) -> Option<Duration> {
    let until = offline_until?;
    let now = Instant::now();
    (now < until).then(|| until - now)
}

fn roll(rng: &mut StdRng, probability: Option<f64>) -> bool {
    match probability {
        Some(p) if p >= 1.0 => true,
        Some(p) if p > 0.0 => rng.gen_bool(p),
        _ => false,
    }
}
