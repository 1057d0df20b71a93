//! Error types for fanout-workers.

use fanout_client::ClientError;
use fanout_core::{DescriptorError, DivergenceReason};
use fanout_types::{ConditionsError, ConversationId};

use crate::config::ConfigError;

/// Errors from worker and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// No worker with that name in the manager.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// The same worker was requested twice.
    #[error("duplicate worker name: {0}")]
    DuplicateWorkerName(String),

    /// The worker has no live client.
    #[error("worker {0} is not initialized")]
    NotInitialized(String),

    /// Client construction failed. Fatal to manager construction.
    #[error("failed to provision worker {name}: {source}")]
    Provisioning {
        /// Worker name
        name: String,
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// A protocol client call failed.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Malformed worker descriptor.
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Invalid network conditions.
    #[error("invalid network conditions: {0}")]
    Conditions(#[from] ConditionsError),

    /// More workers requested than the name pool or manager holds.
    #[error("requested {requested} workers but only {available} are available")]
    NotEnoughWorkers {
        /// Workers asked for
        requested: usize,
        /// Workers that exist
        available: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WorkerError {
    /// Provisioning failures abort manager construction.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, WorkerError::Provisioning { .. })
    }

    /// A simulated network fault; the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Client(err) if err.is_transient())
    }
}

/// Errors from the epoch/fork checker.
#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    /// Participants still disagree after every allowed repair.
    #[error("unresolved fork in group {group} (round {round}, {reason:?}): {participants:?}")]
    UnresolvedFork {
        /// Group under test
        group: ConversationId,
        /// Churn round in which the fork was found
        round: u32,
        /// Participants holding a divergent view
        participants: Vec<String>,
        /// Why the group counts as diverged
        reason: DivergenceReason,
    },

    /// The group is unknown to the worker that has to act on it.
    #[error("group {group} not found for worker {worker}")]
    ConversationNotFound {
        /// Group id
        group: ConversationId,
        /// Worker that looked it up
        worker: String,
    },

    /// No participant is allowed to change membership.
    #[error("no participant can manage members of {0}")]
    NoActor(ConversationId),

    /// Worker-level failure.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl ForkError {
    /// The participant could not be reached or is no longer a member.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ForkError::Worker(err) if err.is_transient() => true,
            ForkError::Worker(WorkerError::Client(ClientError::NotMember { .. })) => true,
            _ => false,
        }
    }
}

impl From<ClientError> for ForkError {
    fn from(err: ClientError) -> Self {
        ForkError::Worker(WorkerError::Client(err))
    }
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_client::LinkError;
    use fanout_types::InboxId;

    #[test]
    fn provisioning_is_flagged() {
        let err = WorkerError::Provisioning {
            name: "alice".into(),
            source: ClientError::UnknownSdkVersion("0.0.1".into()),
        };
        assert!(err.is_provisioning());
        assert!(err.to_string().contains("alice"));
        assert!(!WorkerError::WorkerNotFound("bob".into()).is_provisioning());
    }

    #[test]
    fn client_errors_convert_into_fork_errors() {
        let err: ForkError = ClientError::Closed.into();
        assert!(matches!(err, ForkError::Worker(WorkerError::Client(ClientError::Closed))));
    }

    #[test]
    fn network_and_membership_failures_are_unreachable() {
        let lost: ForkError = ClientError::Network(LinkError::PacketLost).into();
        assert!(lost.is_unreachable());

        let removed: ForkError = ClientError::NotMember {
            inbox: InboxId::new("bob"),
            conversation: ConversationId::new("group"),
        }
        .into();
        assert!(removed.is_unreachable());

        let closed: ForkError = ClientError::Closed.into();
        assert!(!closed.is_unreachable());
        assert!(!ForkError::NoActor(ConversationId::new("group")).is_unreachable());
    }

    #[test]
    fn error_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkerError>();
        assert_send_sync::<ForkError>();
    }
}
