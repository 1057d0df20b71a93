//! Stream verification.
//!
//! Every verification follows the same sequence:
//!
//! 1. Every receiver starts the relevant subscription and subscribes to its
//!    observed events *before* anything is triggered.
//! 2. The deadline is fixed: `now + timeout`.
//! 3. The trigger runs concurrently with one collector per receiver.
//! 4. Whatever was collected by the deadline is scored.
//!
//! Transient failures (lost sends, disconnected receivers) never abort a
//! verification; they show up as lower percentages.

use futures_util::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fanout_client::{Conversation, GroupOptions, GROUP_NAME_FIELD};
use fanout_core::{score, DeliveryStats, ReceiverObservation, SentEvent};
use fanout_types::{
    ConsentEntityType, ConsentRecord, ConversationId, InboxId, StreamEvent, StreamKind,
};

use crate::config::StreamsConfig;
use crate::error::{Result, WorkerError};
use crate::streams::{collect, millis_since};
use crate::worker::Worker;

/// Key used by [`verify_conversation_stream`].
pub const CONVERSATION_KEY: &str = "conversation";

/// Knobs for one verification call.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOptions {
    /// Per-receiver wait budget, measured from subscription
    pub timeout: Duration,
    /// Reception percentage that counts as "almost all"
    pub almost_all_threshold: f64,
    /// Pause between consecutive triggered events
    pub send_interval: Duration,
    /// Suffix tagging generated payloads; random when unset
    pub tag: Option<String>,
}

impl VerifyOptions {
    /// Options from the `[streams]` config section.
    pub fn from_config(config: &StreamsConfig) -> Self {
        Self {
            timeout: config.timeout(),
            almost_all_threshold: config.almost_all_threshold,
            send_interval: Duration::from_millis(config.send_interval_ms),
            tag: None,
        }
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the tolerance threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.almost_all_threshold = threshold;
        self
    }

    /// Fix the payload tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn tag(&self) -> String {
        self.tag.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            id[..8].to_string()
        })
    }
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self::from_config(&StreamsConfig::default())
    }
}

/// Outcome of one verification call.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    /// Subscription that was verified
    pub kind: StreamKind,
    /// Triggers that completed without error
    pub triggered: usize,
    /// Receivers measured
    pub receiver_count: usize,
    /// Threshold applied to `almost_all_received`
    pub almost_all_threshold: f64,
    /// Every expected event reached every receiver
    pub all_received: bool,
    /// Reception reached the threshold
    pub almost_all_received: bool,
    /// Full statistics
    pub stats: DeliveryStats,
}

impl VerificationResult {
    /// Reception percentage.
    pub fn reception_percentage(&self) -> f64 {
        self.stats.reception_percentage
    }

    /// Order percentage.
    pub fn order_percentage(&self) -> f64 {
        self.stats.order_percentage
    }

    /// Mean send-to-observe delay.
    pub fn average_event_timing_ms(&self) -> f64 {
        self.stats.average_event_timing_ms
    }

    /// Distinct events a named receiver observed.
    pub fn received_by(&self, receiver: &str) -> Option<usize> {
        self.stats
            .receivers
            .iter()
            .find(|r| r.receiver == receiver)
            .map(|r| r.received)
    }
}

/// What the trigger reports back.
struct Triggered {
    sent: Vec<SentEvent>,
    succeeded: usize,
}

/// Subscribe, trigger, collect, score.
async fn run<M, T, Fut>(
    kind: StreamKind,
    receivers: &[Arc<Worker>],
    expected: usize,
    key_of: M,
    trigger: T,
    options: &VerifyOptions,
) -> VerificationResult
where
    M: Fn(&StreamEvent) -> Option<String>,
    T: FnOnce(Instant) -> Fut,
    Fut: Future<Output = Triggered>,
{
    if receivers.is_empty() {
        tracing::warn!(%kind, "verification has no receivers, result is vacuous");
    }

    let mut subscriptions = Vec::with_capacity(receivers.len());
    for worker in receivers {
        match worker.start_stream(kind).await {
            Ok(()) => subscriptions.push((worker, Some(worker.subscribe()))),
            Err(err) => {
                tracing::warn!(
                    worker = %worker.name(),
                    %kind,
                    error = %err,
                    "receiver could not subscribe"
                );
                subscriptions.push((worker, None));
            }
        }
    }

    let origin = Instant::now();
    let deadline = origin + options.timeout;
    let key_of = &key_of;
    let collectors = join_all(subscriptions.into_iter().map(|(worker, rx)| async move {
        match rx {
            Some(rx) => {
                collect(worker.name(), rx, origin, deadline, expected, |event| {
                    // Receivers never count their own events
                    if event.sender() == Some(worker.inbox_id()) {
                        return None;
                    }
                    key_of(event)
                })
                .await
            }
            None => ReceiverObservation::empty(worker.name()),
        }
    }));

    let (observations, triggered) = tokio::join!(collectors, trigger(origin));
    let stats = score(&triggered.sent, &observations);
    let result = VerificationResult {
        kind,
        triggered: triggered.succeeded,
        receiver_count: receivers.len(),
        almost_all_threshold: options.almost_all_threshold,
        all_received: stats.all_received(),
        almost_all_received: stats.almost_all_received(options.almost_all_threshold),
        stats,
    };

    if result.all_received {
        tracing::info!(
            %kind,
            receivers = result.receiver_count,
            reception = result.reception_percentage(),
            order = result.order_percentage(),
            timing_ms = result.average_event_timing_ms(),
            "stream verified"
        );
    } else {
        tracing::warn!(
            %kind,
            receivers = result.receiver_count,
            triggered = result.triggered,
            reception = result.reception_percentage(),
            order = result.order_percentage(),
            "stream verification incomplete"
        );
    }
    result
}

async fn pause(interval: Duration, index: usize, total: usize) {
    if !interval.is_zero() && index + 1 < total {
        tokio::time::sleep(interval).await;
    }
}

/// Send `count` tagged messages to `conversation` and measure how many
/// reach each receiver, and in what order.
pub async fn verify_message_stream(
    conversation: &Arc<dyn Conversation>,
    receivers: &[Arc<Worker>],
    count: usize,
    options: &VerifyOptions,
) -> VerificationResult {
    let tag = options.tag();
    let group = conversation.id().clone();
    let key_of = |event: &StreamEvent| match event {
        StreamEvent::Message(message) if message.conversation_id == group => {
            message.text().map(str::to_string)
        }
        _ => None,
    };

    let trigger = |origin: Instant| async move {
        let mut sent = Vec::with_capacity(count);
        let mut succeeded = 0;
        for index in 0..count {
            let body = format!("gm-{}-{}", index + 1, tag);
            sent.push(SentEvent {
                key: body.clone(),
                sent_at_ms: millis_since(origin, Instant::now()),
            });
            match conversation.send(&body).await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    tracing::warn!(group = %conversation.id(), index, error = %err, "send failed")
                }
            }
            pause(options.send_interval, index, count).await;
        }
        Triggered { sent, succeeded }
    };

    run(StreamKind::Message, receivers, count, key_of, trigger, options).await
}

/// Add `added` to `conversation` in one commit and measure how many
/// receivers see the membership update.
pub async fn verify_membership_stream(
    conversation: &Arc<dyn Conversation>,
    receivers: &[Arc<Worker>],
    added: &[InboxId],
    options: &VerifyOptions,
) -> VerificationResult {
    let group = conversation.id().clone();
    let Some(first) = added.first().cloned() else {
        tracing::warn!(group = %group, "membership verification without members to add");
        return run(
            StreamKind::GroupUpdated,
            receivers,
            0,
            |_: &StreamEvent| None,
            |_| async {
                Triggered {
                    sent: Vec::new(),
                    succeeded: 0,
                }
            },
            options,
        )
        .await;
    };

    let key_of = |event: &StreamEvent| match event {
        StreamEvent::GroupUpdated(message) if message.conversation_id == group => message
            .group_update()
            .filter(|update| update.added_inboxes.contains(&first))
            .map(|_| first.to_string()),
        _ => None,
    };

    let sent_key = first.to_string();
    let trigger = |origin: Instant| async move {
        let sent = vec![SentEvent {
            key: sent_key,
            sent_at_ms: millis_since(origin, Instant::now()),
        }];
        let succeeded = match conversation.add_members(added).await {
            Ok(()) => 1,
            Err(err) => {
                tracing::warn!(group = %conversation.id(), error = %err, "add_members failed");
                0
            }
        };
        Triggered { sent, succeeded }
    };

    run(StreamKind::GroupUpdated, receivers, 1, key_of, trigger, options).await
}

/// Rename `conversation` `count` times and measure how many renames reach
/// each receiver.
pub async fn verify_metadata_stream(
    conversation: &Arc<dyn Conversation>,
    receivers: &[Arc<Worker>],
    count: usize,
    options: &VerifyOptions,
) -> VerificationResult {
    let tag = options.tag();
    let group = conversation.id().clone();
    let key_of = |event: &StreamEvent| match event {
        StreamEvent::GroupUpdated(message) if message.conversation_id == group => message
            .group_update()
            .and_then(|update| {
                update
                    .metadata_field_changes
                    .iter()
                    .find(|change| change.field_name == GROUP_NAME_FIELD)
            })
            .map(|change| change.new_value.clone()),
        _ => None,
    };

    let trigger = |origin: Instant| async move {
        let mut sent = Vec::with_capacity(count);
        let mut succeeded = 0;
        for index in 0..count {
            let name = format!("New name-{}-{}", index + 1, tag);
            sent.push(SentEvent {
                key: name.clone(),
                sent_at_ms: millis_since(origin, Instant::now()),
            });
            match conversation.update_name(&name).await {
                Ok(()) => succeeded += 1,
                Err(err) => {
                    tracing::warn!(group = %conversation.id(), index, error = %err, "update_name failed")
                }
            }
            pause(options.send_interval, index, count).await;
        }
        Triggered { sent, succeeded }
    };

    run(StreamKind::GroupUpdated, receivers, count, key_of, trigger, options).await
}

/// Toggle `initiator`'s consent for `target` and measure whether the
/// initiator's own consent subscription reports it.
pub async fn verify_consent_stream(
    initiator: &Arc<Worker>,
    target: &InboxId,
    options: &VerifyOptions,
) -> VerificationResult {
    let entity = target.to_string();
    let key_of = |event: &StreamEvent| match event {
        StreamEvent::Consent(record)
            if record.entity_type == ConsentEntityType::InboxId && record.entity == entity =>
        {
            Some(record.entity.clone())
        }
        _ => None,
    };

    let sent_key = entity.clone();
    let trigger = |origin: Instant| async move {
        let sent = vec![SentEvent {
            key: sent_key.clone(),
            sent_at_ms: millis_since(origin, Instant::now()),
        }];
        let succeeded = match toggle_consent(initiator, ConsentEntityType::InboxId, &sent_key).await
        {
            Ok(()) => 1,
            Err(err) => {
                tracing::warn!(worker = %initiator.name(), error = %err, "consent update failed");
                0
            }
        };
        Triggered { sent, succeeded }
    };

    run(
        StreamKind::Consent,
        std::slice::from_ref(initiator),
        1,
        key_of,
        trigger,
        options,
    )
    .await
}

/// Each receiver toggles its own consent for `group`; measure how many see
/// their own change on their consent subscription.
pub async fn verify_group_consent_stream(
    group: &ConversationId,
    receivers: &[Arc<Worker>],
    options: &VerifyOptions,
) -> VerificationResult {
    let entity = group.to_string();
    let key_of = |event: &StreamEvent| match event {
        StreamEvent::Consent(record)
            if record.entity_type == ConsentEntityType::ConversationId
                && record.entity == entity =>
        {
            Some(record.entity.clone())
        }
        _ => None,
    };

    let sent_key = entity.clone();
    let trigger = |origin: Instant| async move {
        let sent = vec![SentEvent {
            key: sent_key.clone(),
            sent_at_ms: millis_since(origin, Instant::now()),
        }];
        let sent_key = &sent_key;
        let outcomes = join_all(receivers.iter().map(|worker| async move {
            let outcome =
                toggle_consent(worker, ConsentEntityType::ConversationId, sent_key).await;
            if let Err(err) = &outcome {
                tracing::warn!(worker = %worker.name(), group = %sent_key, error = %err, "consent update failed");
            }
            outcome.is_ok()
        }))
        .await;
        Triggered {
            sent,
            succeeded: outcomes.into_iter().filter(|ok| *ok).count(),
        }
    };

    run(StreamKind::Consent, receivers, 1, key_of, trigger, options).await
}

/// `initiator` creates a group with every receiver; measure how many
/// receivers are told about the new conversation.
pub async fn verify_conversation_stream(
    initiator: &Arc<Worker>,
    receivers: &[Arc<Worker>],
    options: &VerifyOptions,
) -> VerificationResult {
    let creator = initiator.inbox_id().clone();
    let key_of = |event: &StreamEvent| match event {
        StreamEvent::Conversation(conversation) if conversation.created_by == creator => {
            Some(CONVERSATION_KEY.to_string())
        }
        _ => None,
    };

    let members: Vec<InboxId> = receivers.iter().map(|w| w.inbox_id().clone()).collect();
    let trigger = |origin: Instant| async move {
        let sent = vec![SentEvent {
            key: CONVERSATION_KEY.to_string(),
            sent_at_ms: millis_since(origin, Instant::now()),
        }];
        let created = match initiator.client() {
            Ok(client) => client
                .new_group(&members, GroupOptions::default())
                .await
                .map_err(WorkerError::from),
            Err(err) => Err(err),
        };
        let succeeded = match created {
            Ok(group) => {
                tracing::debug!(worker = %initiator.name(), group = %group.id(), "group created");
                1
            }
            Err(err) => {
                tracing::warn!(worker = %initiator.name(), error = %err, "group creation failed");
                0
            }
        };
        Triggered { sent, succeeded }
    };

    run(StreamKind::Conversation, receivers, 1, key_of, trigger, options).await
}

async fn toggle_consent(
    worker: &Worker,
    entity_type: ConsentEntityType,
    entity: &str,
) -> Result<()> {
    let client = worker.client()?;
    let current = client.consent_state(entity_type, entity).await?;
    client
        .set_consent_states(&[ConsentRecord {
            entity_type,
            entity: entity.to_string(),
            state: current.toggled(),
        }])
        .await?;
    Ok(())
}
