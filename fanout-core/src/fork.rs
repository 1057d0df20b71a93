//! Epoch churn / fork-check state machine.
//!
//! Pure state transitions for one group under test. The caller (the epoch
//! checker in `fanout-workers`) performs the churn, polling and repair I/O
//! and feeds the outcomes back in as [`ForkEvent`]s.
//!
//! ```text
//! Stable ──RoundStarted──► Churning ──ChurnCompleted──► Verifying
//!   ▲                                                     │
//!   └──────────── Consistent (no repair) ◄────────────────┤
//!                                                         │ Lagging (first time): resync, re-poll
//! Reconciled ◄── Consistent (after repair) ◄── Verifying ◄┤
//!                                                         │ Diverged / still lagging
//!                               Diverged ◄────────────────┘
//!                                 │ RepairCompleted ──► Verifying
//!                                 └ attempts exhausted ──► UnresolvedFork
//! ```

use crate::snapshot::{Comparison, DivergenceReason};

/// How divergence is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPolicy {
    /// Attempt repairs at all
    pub enabled: bool,
    /// Repairs attempted before giving up
    pub max_attempts: u32,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
        }
    }
}

/// Fork-check state for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkCheckState {
    /// All participants agree.
    Stable,
    /// Membership churn for `round` in progress.
    Churning {
        /// Churn round, starting at 0
        round: u32,
    },
    /// Waiting for snapshots from every participant.
    Verifying {
        /// Churn round
        round: u32,
        /// A resync has already been issued for lagging participants
        resynced: bool,
        /// Repairs performed so far in this round
        repair_attempt: u32,
    },
    /// Participants disagree and a repair is in progress.
    Diverged {
        /// Churn round
        round: u32,
        /// Participants holding a divergent view
        participants: Vec<String>,
        /// Repair attempt in progress, starting at 1
        attempt: u32,
    },
    /// A repair brought every participant back in agreement.
    Reconciled {
        /// Round in which the repair happened
        round: u32,
    },
    /// Still diverged after every allowed repair. Terminal.
    UnresolvedFork {
        /// Round in which the fork was found
        round: u32,
        /// Participants still holding a divergent view
        participants: Vec<String>,
    },
}

impl ForkCheckState {
    /// Start in [`ForkCheckState::Stable`].
    pub fn new() -> Self {
        Self::Stable
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// Pure function. Events that make no sense in the current state leave
    /// it unchanged and produce no actions.
    pub fn on_event(self, event: ForkEvent, policy: &RepairPolicy) -> (Self, Vec<ForkAction>) {
        match (self, event) {
            (Self::Stable | Self::Reconciled { .. }, ForkEvent::RoundStarted { round }) => {
                (Self::Churning { round }, vec![ForkAction::Churn { round }])
            }

            (Self::Churning { round }, ForkEvent::ChurnCompleted) => (
                Self::Verifying {
                    round,
                    resynced: false,
                    repair_attempt: 0,
                },
                vec![ForkAction::PollSnapshots],
            ),

            (
                Self::Verifying {
                    round,
                    repair_attempt,
                    ..
                },
                ForkEvent::Compared(Comparison::Consistent { .. }),
            ) => {
                if repair_attempt > 0 {
                    (
                        Self::Reconciled { round },
                        vec![ForkAction::ReportReconciled {
                            round,
                            attempts: repair_attempt,
                        }],
                    )
                } else {
                    (Self::Stable, vec![])
                }
            }

            (
                Self::Verifying {
                    round,
                    resynced: false,
                    repair_attempt,
                },
                ForkEvent::Compared(Comparison::Lagging { .. }),
            ) => (
                Self::Verifying {
                    round,
                    resynced: true,
                    repair_attempt,
                },
                vec![ForkAction::Resync, ForkAction::PollSnapshots],
            ),

            (
                Self::Verifying {
                    round,
                    resynced: true,
                    repair_attempt,
                },
                ForkEvent::Compared(Comparison::Lagging { participants, .. }),
            ) => escalate(
                round,
                participants,
                DivergenceReason::StillLagging,
                repair_attempt,
                policy,
            ),

            (
                Self::Verifying {
                    round,
                    repair_attempt,
                    ..
                },
                ForkEvent::Compared(Comparison::Diverged {
                    participants,
                    reason,
                }),
            ) => escalate(round, participants, reason, repair_attempt, policy),

            (Self::Diverged { round, attempt, .. }, ForkEvent::RepairCompleted) => (
                Self::Verifying {
                    round,
                    resynced: false,
                    repair_attempt: attempt,
                },
                vec![ForkAction::PollSnapshots],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// True once the group is known to be unrecoverable.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::UnresolvedFork { .. })
    }

    /// True while churn or verification for a round is still running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Churning { .. } | Self::Verifying { .. } | Self::Diverged { .. }
        )
    }
}

impl Default for ForkCheckState {
    fn default() -> Self {
        Self::new()
    }
}

fn escalate(
    round: u32,
    participants: Vec<String>,
    reason: DivergenceReason,
    repairs_done: u32,
    policy: &RepairPolicy,
) -> (ForkCheckState, Vec<ForkAction>) {
    if policy.enabled && repairs_done < policy.max_attempts {
        let attempt = repairs_done + 1;
        (
            ForkCheckState::Diverged {
                round,
                participants: participants.clone(),
                attempt,
            },
            vec![ForkAction::Repair {
                participants,
                reason,
                attempt,
            }],
        )
    } else {
        (
            ForkCheckState::UnresolvedFork {
                round,
                participants: participants.clone(),
            },
            vec![ForkAction::ReportUnresolved {
                round,
                participants,
                reason,
            }],
        )
    }
}

/// Inputs to the fork-check state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkEvent {
    /// The checker begins churn round `round`.
    RoundStarted {
        /// Churn round
        round: u32,
    },
    /// The churn commits for the round were issued.
    ChurnCompleted,
    /// Snapshots from every participant were compared.
    Compared(Comparison),
    /// The repair commits were issued.
    RepairCompleted,
}

/// Instructions for the caller. No side effects happen in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkAction {
    /// Remove and re-add churn targets.
    Churn {
        /// Churn round
        round: u32,
    },
    /// Sync every participant and collect snapshots.
    PollSnapshots,
    /// Sync every participant once more before re-polling.
    Resync,
    /// Remove and re-add the divergent participants and manual members.
    Repair {
        /// Participants holding a divergent view
        participants: Vec<String>,
        /// Why the group counts as diverged
        reason: DivergenceReason,
        /// Repair attempt, starting at 1
        attempt: u32,
    },
    /// A repair succeeded.
    ReportReconciled {
        /// Churn round
        round: u32,
        /// Repairs it took
        attempts: u32,
    },
    /// Repairs are exhausted or disabled.
    ReportUnresolved {
        /// Churn round
        round: u32,
        /// Participants holding a divergent view
        participants: Vec<String>,
        /// Why the group counts as diverged
        reason: DivergenceReason,
    },
}
