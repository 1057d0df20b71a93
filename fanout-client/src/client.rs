//! Protocol client adapter surface.
//!
//! The harness talks to the messaging protocol only through these traits.
//! A backend (the in-memory [`crate::memory::MemoryNetwork`], or a binding
//! to a real SDK) implements [`ProtocolClient`] and [`Conversation`], and is
//! registered per SDK version in a [`crate::VersionRegistry`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use fanout_types::{
    Address, ConsentEntityType, ConsentRecord, ConsentState, ConversationId, ConversationKind,
    DebugInfo, Env, InboxId, InstallationId, Member, Message, MessageId, StreamEvent, StreamKind,
};

use crate::link::LinkError;

/// Errors returned by protocol clients.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Wallet or database key is malformed.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// No factory registered for the requested SDK version.
    #[error("unknown sdk version: {0}")]
    UnknownSdkVersion(String),

    /// The local database cannot be opened.
    #[error("database corrupted at {path}: {reason}")]
    DatabaseCorrupted {
        /// Database path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Client construction failed for another reason.
    #[error("client creation failed: {0}")]
    Creation(String),

    /// Conversation unknown to this installation.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// Inbox not registered on the network.
    #[error("inbox not found: {0}")]
    InboxNotFound(InboxId),

    /// The acting inbox is not a member of the conversation.
    #[error("{inbox} is not a member of {conversation}")]
    NotMember {
        /// Acting inbox
        inbox: InboxId,
        /// Conversation
        conversation: ConversationId,
    },

    /// The group's permission policy forbids the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The client was closed.
    #[error("client closed")]
    Closed,

    /// Simulated network failure.
    #[error("network: {0}")]
    Network(#[from] LinkError),
}

impl ClientError {
    /// Errors raised while constructing a client. Fatal to worker creation.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidCredentials(_)
                | ClientError::UnknownSdkVersion(_)
                | ClientError::DatabaseCorrupted { .. }
                | ClientError::Creation(_)
        )
    }

    /// Errors caused by simulated network conditions.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }
}

/// Key material for one identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Hex-encoded 32-byte wallet key, optionally `0x`-prefixed
    pub wallet_key: String,
}

impl Identity {
    /// Wrap a hex wallet key.
    pub fn new(wallet_key: impl Into<String>) -> Self {
        Self {
            wallet_key: wallet_key.into(),
        }
    }

    /// Decode the wallet key.
    pub fn wallet_key_bytes(&self) -> Result<[u8; 32], ClientError> {
        decode_key("wallet key", &self.wallet_key)
    }

    /// Address derived from the wallet key.
    pub fn address(&self) -> Result<Address, ClientError> {
        Ok(Address::from_wallet_key(&self.wallet_key_bytes()?))
    }

    /// Inbox id derived from the wallet key.
    pub fn inbox_id(&self) -> Result<InboxId, ClientError> {
        Ok(InboxId::derive(&self.address()?, 0))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("wallet_key", &"[REDACTED]")
            .finish()
    }
}

/// Decode a hex-encoded 32-byte key.
pub fn decode_key(what: &str, hex_key: &str) -> Result<[u8; 32], ClientError> {
    let trimmed = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    let bytes = hex::decode(trimmed)
        .map_err(|e| ClientError::InvalidCredentials(format!("{} is not hex: {}", what, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ClientError::InvalidCredentials(format!("{} must be 32 bytes, got {}", what, b.len()))
    })
}

/// Options for [`crate::ClientFactory::create`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Deployment to talk to
    pub env: Env,
    /// Local database location; reused across restarts
    pub db_path: PathBuf,
    /// Hex-encoded 32-byte database encryption key
    pub db_encryption_key: String,
    /// SDK version the worker asked for
    pub sdk_version: String,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("env", &self.env)
            .field("db_path", &self.db_path)
            .field("db_encryption_key", &"[REDACTED]")
            .field("sdk_version", &self.sdk_version)
            .finish()
    }
}

/// Who may add and remove members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionPolicy {
    /// Any member
    #[default]
    AllMembers,
    /// Only admins (the creator)
    AdminOnly,
}

/// Options for [`ProtocolClient::new_group`].
#[derive(Debug, Clone, Default)]
pub struct GroupOptions {
    /// Initial group name
    pub name: Option<String>,
    /// Membership permission policy
    pub permissions: PermissionPolicy,
}

impl GroupOptions {
    /// Set the group name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the permission policy.
    pub fn with_permissions(mut self, permissions: PermissionPolicy) -> Self {
        self.permissions = permissions;
        self
    }
}

/// A live subscription. Dropping it releases the subscription.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// One installation's client.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Inbox of this client.
    fn inbox_id(&self) -> &InboxId;

    /// Installation of this client.
    fn installation_id(&self) -> &InstallationId;

    /// Account address.
    fn address(&self) -> &Address;

    /// SDK version of the binding in use.
    fn sdk_version(&self) -> &str;

    /// Native library version of the binding in use.
    fn lib_version(&self) -> &str;

    /// Discover conversations this installation was added to.
    async fn sync(&self) -> Result<(), ClientError>;

    /// Discover new conversations and sync every known one.
    ///
    /// Returns the number of conversations synced.
    async fn sync_all(&self) -> Result<usize, ClientError>;

    /// Conversations known locally.
    async fn list(&self) -> Result<Vec<Arc<dyn Conversation>>, ClientError>;

    /// Create a group with the given members (the caller is added implicitly).
    async fn new_group(
        &self,
        members: &[InboxId],
        options: GroupOptions,
    ) -> Result<Arc<dyn Conversation>, ClientError>;

    /// Find or create the DM with `peer`.
    async fn new_dm(&self, peer: &InboxId) -> Result<Arc<dyn Conversation>, ClientError>;

    /// Look up a locally known conversation.
    async fn conversation_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Arc<dyn Conversation>>, ClientError>;

    /// Open a subscription. Registration is complete when this returns.
    async fn stream(&self, kind: StreamKind) -> Result<EventStream, ClientError>;

    /// Record consent preferences.
    async fn set_consent_states(&self, records: &[ConsentRecord]) -> Result<(), ClientError>;

    /// Read a consent preference.
    async fn consent_state(
        &self,
        entity_type: ConsentEntityType,
        entity: &str,
    ) -> Result<ConsentState, ClientError>;

    /// Release the client. Open subscriptions end.
    async fn close(&self);
}

/// A conversation handle as seen by one installation.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// Conversation id.
    fn id(&self) -> &ConversationId;

    /// Group or DM.
    fn kind(&self) -> ConversationKind;

    /// Send a text message.
    async fn send(&self, text: &str) -> Result<MessageId, ClientError>;

    /// Bring the local view up to date.
    async fn sync(&self) -> Result<(), ClientError>;

    /// Members in the local view.
    async fn members(&self) -> Result<Vec<Member>, ClientError>;

    /// Add members (one commit).
    async fn add_members(&self, inbox_ids: &[InboxId]) -> Result<(), ClientError>;

    /// Remove members (one commit).
    async fn remove_members(&self, inbox_ids: &[InboxId]) -> Result<(), ClientError>;

    /// Rename the group (one commit).
    async fn update_name(&self, name: &str) -> Result<(), ClientError>;

    /// Group name in the local view.
    async fn name(&self) -> Result<String, ClientError>;

    /// Message log, oldest first.
    async fn messages(&self) -> Result<Vec<Message>, ClientError>;

    /// Epoch and fork markers of the local view.
    async fn debug_info(&self) -> Result<DebugInfo, ClientError>;

    /// Whether this installation may add and remove members.
    async fn can_manage_members(&self) -> Result<bool, ClientError>;
}
