//! Identity handles for workers, installations and conversations.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Short prefix used by `Debug` impls so logs stay readable.
fn short(s: &str) -> &str {
    let end = s.char_indices().nth(8).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

/// Account identifier derived from a wallet key.
///
/// Rendered as `0x` followed by 40 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Derive the address for a wallet key (last 20 bytes of its SHA-256).
    pub fn from_wallet_key(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        Self(format!("0x{}", hex::encode(&digest[12..])))
    }

    /// Wrap an already formatted address.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", short(&self.0))
    }
}

/// Protocol identity of a logical user. Shared by all of its installations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboxId(String);

impl InboxId {
    /// Derive the inbox id for an address and nonce.
    ///
    /// The same address and nonce always yield the same inbox.
    pub fn derive(address: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"fanout-inbox-v1");
        hasher.update(address.as_str().as_bytes());
        hasher.update(nonce.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing inbox id string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InboxId({})", short(&self.0))
    }
}

/// One device registration of an inbox.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstallationId(String);

impl InstallationId {
    /// Create a new random installation id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing installation id string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstallationId({})", short(&self.0))
    }
}

/// Identifier of a group or DM.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a new random conversation id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing conversation id string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({})", short(&self.0))
    }
}

/// Identifier of a single message in a conversation log.
///
/// UUID v4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    /// Create a new random MessageId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &self.0.to_string()[..8])
    }
}
