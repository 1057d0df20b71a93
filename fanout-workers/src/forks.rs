//! Epoch / fork checker.
//!
//! Drives [`ForkCheckState`] for one group: each round an admin-capable
//! participant removes and re-adds churn targets, then every participant
//! syncs and reports a [`GroupEpochSnapshot`]. Disagreement is repaired by
//! removing and re-adding the divergent participants together with the
//! manually provisioned members, up to the configured number of attempts.
//!
//! The checker measures; it does not guarantee agreement. An unresolved
//! fork is returned as [`ForkError::UnresolvedFork`]. A participant that
//! cannot be reached is logged and listed as unreachable; the rest are
//! still compared.

use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use fanout_client::{ClientError, Conversation};
use fanout_core::{
    compare_snapshots, Comparison, DivergenceReason, EpochRegression, EpochTracker, ForkAction,
    ForkCheckState, ForkEvent, GroupEpochSnapshot, RepairPolicy,
};
use fanout_types::{ConversationId, InboxId};

use crate::config::ForksConfig;
use crate::error::ForkError;
use crate::manager::WorkerManager;
use crate::worker::Worker;

type Result<T> = std::result::Result<T, ForkError>;

/// Knobs for one epoch check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochCheckOptions {
    /// Churn rounds
    pub epochs: u32,
    /// Members removed and re-added per round
    pub churn_members: usize,
    /// Members provisioned outside the worker set; re-added on repair
    pub extra_members: Vec<InboxId>,
    /// Repair divergence at all
    pub repair: bool,
    /// Repairs per round before giving up
    pub max_repair_attempts: u32,
    /// Seed for actor and target selection
    pub seed: Option<u64>,
}

impl EpochCheckOptions {
    /// Options from the `[forks]` config section.
    pub fn from_config(config: &ForksConfig) -> Self {
        Self {
            epochs: config.epochs,
            churn_members: config.churn_members.max(1),
            extra_members: Vec::new(),
            repair: config.repair,
            max_repair_attempts: config.max_repair_attempts,
            seed: None,
        }
    }

    /// Override the number of rounds.
    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    /// Members to re-add on repair.
    pub fn with_extra_members(mut self, members: Vec<InboxId>) -> Self {
        self.extra_members = members;
        self
    }

    /// Fix the selection seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn policy(&self) -> RepairPolicy {
        RepairPolicy {
            enabled: self.repair,
            max_attempts: self.max_repair_attempts,
        }
    }
}

impl Default for EpochCheckOptions {
    fn default() -> Self {
        Self::from_config(&ForksConfig::default())
    }
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Every participant agreed without repair
    Stable,
    /// Agreement after `attempts` repairs
    Reconciled {
        /// Repairs it took
        attempts: u32,
    },
    /// Still diverged after every allowed repair
    Unresolved {
        /// Divergent participants
        participants: Vec<String>,
        /// Why
        reason: DivergenceReason,
    },
}

/// One churn round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    /// Round number, from 0
    pub round: u32,
    /// Participant that issued the churn commits
    pub actor: String,
    /// Inboxes removed and re-added
    pub churned: Vec<InboxId>,
    /// Agreed epoch at the end of the round, if any
    pub epoch: Option<u64>,
    /// Participants whose last snapshot failed
    pub unreachable: Vec<String>,
    /// How the round ended
    pub outcome: RoundOutcome,
}

/// Result of [`EpochChecker::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    /// Group under test
    pub group: ConversationId,
    /// Rounds run, in order
    pub rounds: Vec<RoundReport>,
    /// Last comparison made
    pub final_comparison: Option<Comparison>,
    /// Snapshots behind the last comparison
    pub snapshots: Vec<GroupEpochSnapshot>,
    /// Participants left out of the last comparison
    pub unreachable: Vec<String>,
    /// Epochs that went backwards between polls
    pub regressions: Vec<EpochRegression>,
}

impl EpochReport {
    /// The last comparison found every participant in agreement.
    pub fn is_consistent(&self) -> bool {
        self.final_comparison
            .as_ref()
            .is_some_and(Comparison::is_consistent)
    }

    /// The round that ended unresolved, if any.
    pub fn unresolved(&self) -> Option<&RoundReport> {
        self.rounds
            .iter()
            .find(|r| matches!(r.outcome, RoundOutcome::Unresolved { .. }))
    }
}

/// Churn, poll and repair one group.
pub struct EpochChecker<'a> {
    manager: &'a WorkerManager,
    group: ConversationId,
    options: EpochCheckOptions,
    participants: Vec<Arc<Worker>>,
    tracker: EpochTracker,
    rng: StdRng,
}

impl<'a> EpochChecker<'a> {
    /// Checker for `group` over the workers of `manager`.
    pub fn new(manager: &'a WorkerManager, group: ConversationId, options: EpochCheckOptions) -> Self {
        let rng = match options.seed.or(manager.config().network.seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            manager,
            group,
            options,
            participants: Vec::new(),
            tracker: EpochTracker::new(),
            rng,
        }
    }

    /// Run every round. An unresolved fork ends the run early and is
    /// returned as an error.
    pub async fn run(mut self) -> Result<EpochReport> {
        self.participants = self.discover_participants().await?;
        let policy = self.options.policy();
        let mut state = ForkCheckState::new();
        let mut report = EpochReport {
            group: self.group.clone(),
            rounds: Vec::new(),
            final_comparison: None,
            snapshots: Vec::new(),
            unreachable: Vec::new(),
            regressions: Vec::new(),
        };

        tracing::info!(
            group = %self.group,
            participants = self.participants.len(),
            epochs = self.options.epochs,
            "epoch check started"
        );

        for round in 0..self.options.epochs {
            let mut actor = String::new();
            let mut churned = Vec::new();
            let mut outcome = RoundOutcome::Stable;
            let mut unresolved = None;

            let (next, actions) = state.on_event(ForkEvent::RoundStarted { round }, &policy);
            state = next;
            let mut pending: VecDeque<ForkAction> = actions.into();

            while let Some(action) = pending.pop_front() {
                let event = match action {
                    ForkAction::Churn { round } => {
                        let (who, targets) = self.churn(round).await?;
                        actor = who;
                        churned = targets;
                        Some(ForkEvent::ChurnCompleted)
                    }
                    ForkAction::PollSnapshots => {
                        let (snapshots, unreachable) = self.poll().await?;
                        let comparison = if snapshots.is_empty() {
                            Comparison::Lagging {
                                max_epoch: 0,
                                participants: unreachable.clone(),
                            }
                        } else {
                            compare_snapshots(&snapshots)
                        };
                        tracing::debug!(group = %self.group, round, ?comparison, "snapshots compared");
                        report.final_comparison = Some(comparison.clone());
                        report.snapshots = snapshots;
                        report.unreachable = unreachable;
                        Some(ForkEvent::Compared(comparison))
                    }
                    ForkAction::Resync => {
                        self.resync().await;
                        None
                    }
                    ForkAction::Repair {
                        participants,
                        reason,
                        attempt,
                    } => {
                        tracing::warn!(
                            group = %self.group,
                            round,
                            attempt,
                            ?reason,
                            ?participants,
                            "group diverged, repairing"
                        );
                        self.repair(&participants).await?;
                        Some(ForkEvent::RepairCompleted)
                    }
                    ForkAction::ReportReconciled { round, attempts } => {
                        tracing::info!(group = %self.group, round, attempts, "group reconciled");
                        outcome = RoundOutcome::Reconciled { attempts };
                        None
                    }
                    ForkAction::ReportUnresolved {
                        round,
                        participants,
                        reason,
                    } => {
                        tracing::error!(
                            group = %self.group,
                            round,
                            ?reason,
                            ?participants,
                            "unresolved fork"
                        );
                        outcome = RoundOutcome::Unresolved {
                            participants: participants.clone(),
                            reason,
                        };
                        unresolved = Some((participants, reason));
                        None
                    }
                };
                if let Some(event) = event {
                    let (next, actions) = state.on_event(event, &policy);
                    state = next;
                    pending.extend(actions);
                }
            }

            let epoch = match &report.final_comparison {
                Some(Comparison::Consistent { epoch, .. }) => Some(*epoch),
                _ => None,
            };
            report.rounds.push(RoundReport {
                round,
                actor,
                churned,
                epoch,
                unreachable: report.unreachable.clone(),
                outcome,
            });

            if let Some((participants, reason)) = unresolved {
                return Err(ForkError::UnresolvedFork {
                    group: self.group.clone(),
                    round,
                    participants,
                    reason,
                });
            }
        }

        report.regressions = self.tracker.regressions().to_vec();
        if !report.regressions.is_empty() {
            tracing::warn!(group = %self.group, regressions = ?report.regressions, "epoch went backwards");
        }
        tracing::info!(
            group = %self.group,
            rounds = report.rounds.len(),
            consistent = report.is_consistent(),
            "epoch check finished"
        );
        Ok(report)
    }

    async fn discover_participants(&self) -> Result<Vec<Arc<Worker>>> {
        let mut participants = Vec::new();
        for worker in self.manager.get_all() {
            match worker.conversation(&self.group).await {
                Ok(Some(_)) => participants.push(worker),
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    tracing::warn!(worker = %worker.name(), error = %err, "participant lookup failed");
                    participants.push(worker);
                }
                Err(err) => return Err(err.into()),
            }
        }
        if participants.is_empty() {
            let worker = self
                .manager
                .creator()
                .map(|w| w.name().to_string())
                .unwrap_or_default();
            return Err(ForkError::ConversationNotFound {
                group: self.group.clone(),
                worker,
            });
        }
        Ok(participants)
    }

    async fn group_of(&self, worker: &Worker) -> Result<Arc<dyn Conversation>> {
        worker
            .conversation(&self.group)
            .await?
            .ok_or_else(|| ForkError::ConversationNotFound {
                group: self.group.clone(),
                worker: worker.name().to_string(),
            })
    }

    /// A random participant allowed to change membership, skipping `exclude`.
    async fn pick_actor(
        &mut self,
        exclude: &BTreeSet<String>,
    ) -> Result<(Arc<Worker>, Arc<dyn Conversation>)> {
        let mut candidates = self.participants.clone();
        candidates.shuffle(&mut self.rng);
        for worker in candidates {
            if exclude.contains(worker.name()) {
                continue;
            }
            let Ok(conversation) = self.group_of(&worker).await else {
                continue;
            };
            if conversation.can_manage_members().await.unwrap_or(false) {
                return Ok((worker, conversation));
            }
        }
        Err(ForkError::NoActor(self.group.clone()))
    }

    async fn churn(&mut self, round: u32) -> Result<(String, Vec<InboxId>)> {
        let (actor, conversation) = self.pick_actor(&BTreeSet::new()).await?;
        let members = match conversation.members().await {
            Ok(members) => members,
            Err(err) => {
                tracing::error!(group = %self.group, actor = %actor.name(), error = %err, "member listing failed");
                return Ok((actor.name().to_string(), Vec::new()));
            }
        };
        let mut candidates: Vec<InboxId> = members
            .into_iter()
            .map(|m| m.inbox_id)
            .filter(|inbox| inbox != actor.inbox_id())
            .collect();
        candidates.shuffle(&mut self.rng);

        let mut churned = Vec::new();
        for target in candidates {
            if churned.len() >= self.options.churn_members {
                break;
            }
            let target_slice = std::slice::from_ref(&target);
            match conversation.remove_members(target_slice).await {
                Ok(()) => {}
                Err(ClientError::PermissionDenied(reason)) => {
                    tracing::debug!(group = %self.group, target = %target, %reason, "churn target skipped");
                    continue;
                }
                Err(err) => {
                    tracing::error!(group = %self.group, target = %target, error = %err, "remove failed");
                    continue;
                }
            }
            if let Err(err) = conversation.add_members(target_slice).await {
                tracing::error!(group = %self.group, target = %target, error = %err, "re-add failed");
            }
            churned.push(target);
        }

        if churned.is_empty() {
            tracing::warn!(group = %self.group, round, actor = %actor.name(), "nothing to churn");
        } else {
            tracing::debug!(group = %self.group, round, actor = %actor.name(), ?churned, "churned");
        }
        Ok((actor.name().to_string(), churned))
    }

    /// Snapshot every participant. Unreachable participants are returned by
    /// name instead of failing the poll.
    async fn poll(&mut self) -> Result<(Vec<GroupEpochSnapshot>, Vec<String>)> {
        let group = &self.group;
        let outcomes = join_all(
            self.participants
                .iter()
                .map(|worker| snapshot(worker, group)),
        )
        .await;

        let mut snapshots = Vec::with_capacity(outcomes.len());
        let mut unreachable = Vec::new();
        for (worker, outcome) in self.participants.iter().zip(outcomes) {
            match outcome {
                Ok(taken) => snapshots.push(taken),
                Err(err) if err.is_unreachable() => {
                    tracing::warn!(group = %self.group, worker = %worker.name(), error = %err, "snapshot failed");
                    unreachable.push(worker.name().to_string());
                }
                Err(err) => return Err(err),
            }
        }
        for regression in self.tracker.record_all(&self.group, &snapshots) {
            tracing::warn!(
                group = %self.group,
                participant = %regression.participant,
                previous = regression.previous,
                observed = regression.observed,
                "epoch regression"
            );
        }
        Ok((snapshots, unreachable))
    }

    async fn resync(&self) {
        join_all(self.participants.iter().map(|worker| async move {
            if let Err(err) = worker.sync_all().await {
                tracing::warn!(worker = %worker.name(), error = %err, "resync failed");
            }
        }))
        .await;
    }

    async fn repair(&mut self, diverged: &[String]) -> Result<()> {
        let exclude: BTreeSet<String> = diverged.iter().cloned().collect();
        let (actor, conversation) = match self.pick_actor(&exclude).await {
            Ok(found) => found,
            Err(ForkError::NoActor(_)) => self.pick_actor(&BTreeSet::new()).await?,
            Err(err) => return Err(err),
        };

        let mut targets: Vec<InboxId> = Vec::new();
        let diverged_inboxes = self
            .participants
            .iter()
            .filter(|w| exclude.contains(w.name()))
            .map(|w| w.inbox_id().clone());
        for inbox in diverged_inboxes.chain(self.options.extra_members.iter().cloned()) {
            if inbox != *actor.inbox_id() && !targets.contains(&inbox) {
                targets.push(inbox);
            }
        }

        let mut removed = Vec::new();
        for target in &targets {
            match conversation.remove_members(std::slice::from_ref(target)).await {
                Ok(()) => removed.push(target.clone()),
                Err(err) => {
                    tracing::warn!(group = %self.group, target = %target, error = %err, "repair remove failed")
                }
            }
        }
        if !removed.is_empty() {
            if let Err(err) = conversation.add_members(&removed).await {
                tracing::error!(group = %self.group, ?removed, error = %err, "repair re-add failed");
            }
        }
        tracing::debug!(group = %self.group, actor = %actor.name(), ?removed, "repair issued");
        Ok(())
    }
}

async fn snapshot(worker: &Worker, group: &ConversationId) -> Result<GroupEpochSnapshot> {
    let conversation =
        worker
            .conversation(group)
            .await?
            .ok_or_else(|| ForkError::ConversationNotFound {
                group: group.clone(),
                worker: worker.name().to_string(),
            })?;
    conversation.sync().await?;
    let info = conversation.debug_info().await?;
    let member_inbox_ids = conversation
        .members()
        .await?
        .into_iter()
        .map(|m| m.inbox_id)
        .collect();
    Ok(GroupEpochSnapshot {
        participant: worker.name().to_string(),
        epoch: info.epoch,
        member_inbox_ids,
        maybe_forked: info.maybe_forked,
    })
}

/// Run `epochs` churn rounds on `group` with the manager's `[forks]`
/// settings. Fails with [`ForkError::UnresolvedFork`] if the group cannot
/// be brought back into agreement.
pub async fn verify_epoch_change(
    manager: &WorkerManager,
    group: &ConversationId,
    epochs: u32,
) -> Result<EpochReport> {
    let options = EpochCheckOptions::from_config(&manager.config().forks).with_epochs(epochs);
    EpochChecker::new(manager, group.clone(), options).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyCache;
    use crate::manager::{get_workers, ManagerOptions};
    use fanout_client::MemoryNetwork;
    use fanout_types::NetworkConditions;

    async fn setup(count: usize) -> (MemoryNetwork, WorkerManager) {
        let network = MemoryNetwork::new();
        let options = ManagerOptions::new(network.registry())
            .with_keys(Arc::new(KeyCache::generated()));
        let manager = get_workers(count, "forks", options).await.unwrap();
        (network, manager)
    }

    #[test]
    fn options_follow_config() {
        let config = ForksConfig {
            epochs: 7,
            churn_members: 0,
            repair: false,
            max_repair_attempts: 4,
        };
        let options = EpochCheckOptions::from_config(&config);
        assert_eq!(options.epochs, 7);
        assert_eq!(options.churn_members, 1);
        assert_eq!(options.policy(), RepairPolicy { enabled: false, max_attempts: 4 });
    }

    #[tokio::test]
    async fn clean_group_stays_stable() {
        let (network, manager) = setup(4).await;
        let group = manager.create_group_between_all(None, &[]).await.unwrap();
        let before = network.conversation_epoch(group.id()).unwrap();

        let options = EpochCheckOptions::default().with_epochs(2).with_seed(3);
        let report = EpochChecker::new(&manager, group.id().clone(), options)
            .run()
            .await
            .unwrap();

        assert_eq!(report.rounds.len(), 2);
        assert!(report
            .rounds
            .iter()
            .all(|r| r.outcome == RoundOutcome::Stable && r.churned.len() == 1));
        assert!(report.is_consistent());
        assert!(report.regressions.is_empty());
        assert_eq!(network.conversation_epoch(group.id()), Some(before + 4));
        assert_eq!(report.rounds[1].epoch, Some(before + 4));
    }

    #[tokio::test]
    async fn healable_fork_is_reconciled_by_repair() {
        let (network, manager) = setup(3).await;
        let extra = network.register_inbox();
        let group = manager
            .create_group_between_all(None, std::slice::from_ref(&extra))
            .await
            .unwrap();
        let charlie = manager.must_get("charlie").unwrap();
        network.inject_fork(charlie.db_path(), group.id(), false).unwrap();
        let before = network.conversation_epoch(group.id()).unwrap();

        // No churn, so only the repair commits can heal the fork
        let options = EpochCheckOptions {
            epochs: 1,
            churn_members: 0,
            extra_members: vec![extra.clone()],
            repair: true,
            max_repair_attempts: 2,
            seed: Some(1),
        };
        let report = EpochChecker::new(&manager, group.id().clone(), options)
            .run()
            .await
            .unwrap();

        let round = &report.rounds[0];
        assert!(round.churned.is_empty());
        assert_eq!(round.outcome, RoundOutcome::Reconciled { attempts: 1 });
        assert!(report.is_consistent());
        assert!(report.snapshots.iter().all(|s| !s.maybe_forked));

        // charlie and the extra member removed one by one, then re-added together
        assert_eq!(network.conversation_epoch(group.id()), Some(before + 3));
        assert_eq!(round.epoch, Some(before + 3));
        let members = network.members_of(group.id()).unwrap();
        assert!(members.contains(&extra));
        assert!(members.contains(charlie.inbox_id()));
        assert!(!manager.check_forks().await.has_forks());
    }

    #[tokio::test]
    async fn unreachable_participant_does_not_abort_the_check() {
        let (_network, manager) = setup(4).await;
        let group = manager.create_group_between_all(None, &[]).await.unwrap();
        manager
            .set_worker_network_conditions("diana", NetworkConditions::none().packet_loss(1.0))
            .unwrap();

        let report = verify_epoch_change(&manager, group.id(), 1).await.unwrap();

        assert_eq!(report.unreachable, vec!["diana".to_string()]);
        assert_eq!(report.rounds[0].unreachable, vec!["diana".to_string()]);
        assert_eq!(report.snapshots.len(), 3);
        assert!(report.snapshots.iter().all(|s| s.participant != "diana"));
        assert!(report.is_consistent());
        assert_eq!(report.rounds[0].outcome, RoundOutcome::Stable);
    }

    #[tokio::test]
    async fn every_participant_unreachable_is_unresolved() {
        let (_network, manager) = setup(2).await;
        let group = manager.create_group_between_all(None, &[]).await.unwrap();
        for name in ["alice", "bob"] {
            manager
                .set_worker_network_conditions(name, NetworkConditions::none().packet_loss(1.0))
                .unwrap();
        }

        let err = verify_epoch_change(&manager, group.id(), 1).await.unwrap_err();
        match err {
            ForkError::UnresolvedFork { reason, participants, .. } => {
                assert_eq!(reason, DivergenceReason::StillLagging);
                assert_eq!(participants.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn persistent_fork_is_unresolved() {
        let (network, manager) = setup(3).await;
        let group = manager.create_group_between_all(None, &[]).await.unwrap();
        let bob = manager.must_get("bob").unwrap();
        network.inject_fork(bob.db_path(), group.id(), true).unwrap();

        let err = verify_epoch_change(&manager, group.id(), 2).await.unwrap_err();
        match err {
            ForkError::UnresolvedFork {
                participants,
                reason,
                round,
                ..
            } => {
                assert_eq!(round, 0);
                assert!(participants.contains(&"bob".to_string()));
                assert_eq!(reason, DivergenceReason::MaybeForked);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn repair_disabled_reports_immediately() {
        let (network, manager) = setup(3).await;
        let group = manager.create_group_between_all(None, &[]).await.unwrap();
        let bob = manager.must_get("bob").unwrap();
        network.inject_fork(bob.db_path(), group.id(), true).unwrap();

        let options = EpochCheckOptions {
            repair: false,
            ..EpochCheckOptions::default().with_epochs(1)
        };
        let result = EpochChecker::new(&manager, group.id().clone(), options).run().await;
        assert!(matches!(result, Err(ForkError::UnresolvedFork { .. })));
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let (_network, manager) = setup(2).await;
        let err = verify_epoch_change(&manager, &ConversationId::new("missing"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ForkError::ConversationNotFound { .. }));
    }
}
