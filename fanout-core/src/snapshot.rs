//! Group epoch snapshots and cross-participant comparison.
//!
//! Every participant in a group reports its local view (epoch, member set,
//! fork flag). [`compare_snapshots`] decides whether those views agree, lag
//! behind each other, or have diverged. [`EpochTracker`] checks that a
//! single participant's epoch never goes backwards between polls.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use fanout_types::{ConversationId, InboxId};

/// One participant's view of a group at one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEpochSnapshot {
    /// Worker name of the participant
    pub participant: String,
    /// Local epoch
    pub epoch: u64,
    /// Local member set
    pub member_inbox_ids: BTreeSet<InboxId>,
    /// Group introspection flagged a possible fork
    pub maybe_forked: bool,
}

/// Why a set of snapshots counts as diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DivergenceReason {
    /// At least one participant reported `maybe_forked`
    MaybeForked,
    /// Two participants at the same epoch disagree on membership
    MembershipConflict {
        /// The epoch with conflicting member sets
        epoch: u64,
    },
    /// Participants still disagree on the epoch after a resync
    StillLagging,
}

/// Outcome of comparing all snapshots taken at one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Comparison {
    /// Same epoch and member set everywhere, no fork flags
    Consistent {
        /// The agreed epoch
        epoch: u64,
        /// Size of the agreed member set
        member_count: usize,
    },
    /// Only the epochs differ; the listed participants are behind
    Lagging {
        /// Highest epoch reported
        max_epoch: u64,
        /// Participants below `max_epoch`
        participants: Vec<String>,
    },
    /// Views are inconsistent
    Diverged {
        /// Participants holding a minority or flagged view
        participants: Vec<String>,
        /// First reason found
        reason: DivergenceReason,
    },
}

impl Comparison {
    /// True for [`Comparison::Consistent`].
    pub fn is_consistent(&self) -> bool {
        matches!(self, Comparison::Consistent { .. })
    }
}

/// Compare the snapshots of every participant taken at the same point.
///
/// Fork flags win over membership conflicts, which win over epoch lag.
/// For a membership conflict the most common member set at that epoch is
/// taken as the reference; ties go to the set reported first.
pub fn compare_snapshots(snapshots: &[GroupEpochSnapshot]) -> Comparison {
    if snapshots.is_empty() {
        return Comparison::Consistent {
            epoch: 0,
            member_count: 0,
        };
    }

    let forked: Vec<String> = snapshots
        .iter()
        .filter(|s| s.maybe_forked)
        .map(|s| s.participant.clone())
        .collect();
    if !forked.is_empty() {
        return Comparison::Diverged {
            participants: forked,
            reason: DivergenceReason::MaybeForked,
        };
    }

    let mut by_epoch: BTreeMap<u64, Vec<&GroupEpochSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        by_epoch.entry(snapshot.epoch).or_default().push(snapshot);
    }

    for (&epoch, group) in &by_epoch {
        let reference = majority_members(group);
        let conflicting: Vec<String> = group
            .iter()
            .filter(|s| &s.member_inbox_ids != reference)
            .map(|s| s.participant.clone())
            .collect();
        if !conflicting.is_empty() {
            return Comparison::Diverged {
                participants: conflicting,
                reason: DivergenceReason::MembershipConflict { epoch },
            };
        }
    }

    let Some((&max_epoch, top)) = by_epoch.iter().next_back() else {
        return Comparison::Consistent {
            epoch: 0,
            member_count: 0,
        };
    };
    if by_epoch.len() > 1 {
        let participants = snapshots
            .iter()
            .filter(|s| s.epoch < max_epoch)
            .map(|s| s.participant.clone())
            .collect();
        return Comparison::Lagging {
            max_epoch,
            participants,
        };
    }

    Comparison::Consistent {
        epoch: max_epoch,
        member_count: top[0].member_inbox_ids.len(),
    }
}

fn majority_members<'a>(group: &[&'a GroupEpochSnapshot]) -> &'a BTreeSet<InboxId> {
    let mut counts: Vec<(&'a BTreeSet<InboxId>, usize)> = Vec::new();
    for snapshot in group {
        let set = &snapshot.member_inbox_ids;
        match counts.iter().position(|(seen, _)| *seen == set) {
            Some(i) => counts[i].1 += 1,
            None => counts.push((set, 1)),
        }
    }

    // max_by_key keeps the last maximum, so walk in reverse to favour the first
    counts
        .iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map(|(set, _)| *set)
        .unwrap_or(&group[0].member_inbox_ids)
}

/// A participant observed a lower epoch than it reported before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochRegression {
    /// Participant that regressed
    pub participant: String,
    /// Group the epoch belongs to
    pub group: ConversationId,
    /// Epoch previously observed
    pub previous: u64,
    /// Epoch observed now
    pub observed: u64,
}

/// Tracks the last epoch each participant reported for each group.
#[derive(Debug, Clone, Default)]
pub struct EpochTracker {
    last: HashMap<(String, ConversationId), u64>,
    regressions: Vec<EpochRegression>,
}

impl EpochTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. Fails if the epoch went backwards.
    ///
    /// The highest epoch seen is kept, so one regression does not mask a
    /// later one.
    pub fn record(
        &mut self,
        participant: &str,
        group: &ConversationId,
        epoch: u64,
    ) -> Result<(), EpochRegression> {
        let key = (participant.to_string(), group.clone());
        match self.last.get(&key) {
            Some(&previous) if epoch < previous => {
                let regression = EpochRegression {
                    participant: participant.to_string(),
                    group: group.clone(),
                    previous,
                    observed: epoch,
                };
                self.regressions.push(regression.clone());
                Err(regression)
            }
            _ => {
                self.last.insert(key, epoch);
                Ok(())
            }
        }
    }

    /// Record every snapshot of one poll.
    pub fn record_all(
        &mut self,
        group: &ConversationId,
        snapshots: &[GroupEpochSnapshot],
    ) -> Vec<EpochRegression> {
        snapshots
            .iter()
            .filter_map(|s| self.record(&s.participant, group, s.epoch).err())
            .collect()
    }

    /// Last epoch seen for a participant in a group.
    pub fn last_epoch(&self, participant: &str, group: &ConversationId) -> Option<u64> {
        self.last
            .get(&(participant.to_string(), group.clone()))
            .copied()
    }

    /// Every regression recorded so far.
    pub fn regressions(&self) -> &[EpochRegression] {
        &self.regressions
    }
}
