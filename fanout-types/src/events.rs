//! Conversation, consent and stream event model.
//!
//! These are the values the protocol client adapter hands back to the
//! harness: what kind of conversation a handle refers to, the events that
//! arrive on subscriptions, and the group introspection used for fork
//! detection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ConversationId, InboxId, InstallationId, MessageId, ParseError};

/// Whether a conversation is a group or a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Multi-party group with membership commits
    Group,
    /// Two-party conversation
    Dm,
}

impl ConversationKind {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Group => "group",
            ConversationKind::Dm => "dm",
        }
    }
}

/// Protocol deployment a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    /// Local node
    #[default]
    Local,
    /// Shared development network
    Dev,
    /// Production network
    Production,
}

impl Env {
    /// Lowercase name, also used in database paths.
    pub fn as_str(self) -> &'static str {
        match self {
            Env::Local => "local",
            Env::Dev => "dev",
            Env::Production => "production",
        }
    }
}

impl FromStr for Env {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Env::Local),
            "dev" => Ok(Env::Dev),
            "production" | "prod" => Ok(Env::Production),
            other => Err(ParseError::Env(other.to_string())),
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event subscription a worker can hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Text messages in any conversation
    Message,
    /// Membership and metadata commits
    GroupUpdated,
    /// Newly joined conversations
    Conversation,
    /// Consent preference changes
    Consent,
}

impl StreamKind {
    /// Every kind, in a stable order.
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Message,
        StreamKind::GroupUpdated,
        StreamKind::Conversation,
        StreamKind::Consent,
    ];

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Message => "message",
            StreamKind::GroupUpdated => "group_updated",
            StreamKind::Conversation => "conversation",
            StreamKind::Consent => "consent",
        }
    }
}

impl FromStr for StreamKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(StreamKind::Message),
            "group_updated" | "membership" | "metadata" => Ok(StreamKind::GroupUpdated),
            "conversation" => Ok(StreamKind::Conversation),
            "consent" => Ok(StreamKind::Consent),
            other => Err(ParseError::StreamKind(other.to_string())),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metadata field changed by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFieldChange {
    /// Field name, e.g. `group_name`
    pub field_name: String,
    /// Value before the commit
    pub old_value: Option<String>,
    /// Value after the commit
    pub new_value: String,
}

/// Content of a group-updated commit message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// Inbox that issued the commit
    pub initiated_by: Option<InboxId>,
    /// Inboxes added by the commit
    pub added_inboxes: Vec<InboxId>,
    /// Inboxes removed by the commit
    pub removed_inboxes: Vec<InboxId>,
    /// Metadata fields changed by the commit
    pub metadata_field_changes: Vec<MetadataFieldChange>,
}

/// Decoded message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Membership or metadata commit
    GroupUpdated(GroupUpdate),
}

/// A message as stored in a conversation log and delivered on streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier
    pub id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Author inbox
    pub sender_inbox_id: InboxId,
    /// Decoded content
    pub content: MessageContent,
    /// Group epoch at the time the message was published
    pub epoch: u64,
    /// Publish time, nanoseconds since the Unix epoch
    pub sent_at_ns: u64,
}

impl Message {
    /// Text body, if this is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::GroupUpdated(_) => None,
        }
    }

    /// Commit details, if this is a group update.
    pub fn group_update(&self) -> Option<&GroupUpdate> {
        match &self.content {
            MessageContent::GroupUpdated(update) => Some(update),
            MessageContent::Text(_) => None,
        }
    }

    /// Rough wire size used for bandwidth shaping.
    pub fn payload_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.len(),
            MessageContent::GroupUpdated(update) => {
                64 * (update.added_inboxes.len() + update.removed_inboxes.len() + 1)
                    + update
                        .metadata_field_changes
                        .iter()
                        .map(|c| c.new_value.len())
                        .sum::<usize>()
            }
        }
    }
}

/// Subject of a consent preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentEntityType {
    /// Another user's inbox
    InboxId,
    /// A conversation
    ConversationId,
}

/// Consent preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    /// Never set
    #[default]
    Unknown,
    /// Explicitly allowed
    Allowed,
    /// Explicitly denied
    Denied,
}

impl ConsentState {
    /// The opposite explicit state, used to toggle consent in scenarios.
    pub fn toggled(self) -> Self {
        match self {
            ConsentState::Allowed => ConsentState::Denied,
            ConsentState::Denied | ConsentState::Unknown => ConsentState::Allowed,
        }
    }
}

impl FromStr for ConsentState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(ConsentState::Unknown),
            "allowed" => Ok(ConsentState::Allowed),
            "denied" => Ok(ConsentState::Denied),
            other => Err(ParseError::ConsentState(other.to_string())),
        }
    }
}

/// One consent entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// What the preference is about
    pub entity_type: ConsentEntityType,
    /// Inbox id or conversation id, depending on `entity_type`
    pub entity: String,
    /// New state
    pub state: ConsentState,
}

/// Conversation announced to a new member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    /// Conversation id
    pub conversation_id: ConversationId,
    /// Group or DM
    pub kind: ConversationKind,
    /// Inbox that created it
    pub created_by: InboxId,
}

/// An event delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text message
    Message(Message),
    /// Membership or metadata commit
    GroupUpdated(Message),
    /// New conversation
    Conversation(ConversationEvent),
    /// Consent changes
    Consent(ConsentRecord),
}

impl StreamEvent {
    /// The subscription kind this event belongs to.
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamEvent::Message(_) => StreamKind::Message,
            StreamEvent::GroupUpdated(_) => StreamKind::GroupUpdated,
            StreamEvent::Conversation(_) => StreamKind::Conversation,
            StreamEvent::Consent(_) => StreamKind::Consent,
        }
    }

    /// Conversation the event is about, when there is one.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            StreamEvent::Message(m) | StreamEvent::GroupUpdated(m) => Some(&m.conversation_id),
            StreamEvent::Conversation(c) => Some(&c.conversation_id),
            StreamEvent::Consent(_) => None,
        }
    }

    /// Author of a message event.
    pub fn sender(&self) -> Option<&InboxId> {
        match self {
            StreamEvent::Message(m) | StreamEvent::GroupUpdated(m) => Some(&m.sender_inbox_id),
            StreamEvent::Conversation(_) | StreamEvent::Consent(_) => None,
        }
    }

    /// Rough wire size used for bandwidth shaping.
    pub fn payload_len(&self) -> usize {
        match self {
            StreamEvent::Message(m) | StreamEvent::GroupUpdated(m) => m.payload_len(),
            StreamEvent::Conversation(_) => 64,
            StreamEvent::Consent(record) => record.entity.len(),
        }
    }
}

/// A group member as seen by one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member inbox
    pub inbox_id: InboxId,
    /// Known installations of that inbox
    pub installation_ids: Vec<InstallationId>,
}

/// Group introspection used for fork detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    /// Local view of the group epoch
    pub epoch: u64,
    /// The installation suspects its group state has diverged
    pub maybe_forked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(text: &str) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: ConversationId::new("c1"),
            sender_inbox_id: InboxId::new("alice"),
            content: MessageContent::Text(text.into()),
            epoch: 1,
            sent_at_ns: 0,
        }
    }

    #[test]
    fn stream_kind_parse_and_display() {
        for kind in StreamKind::ALL {
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
        }
        assert_eq!(
            "metadata".parse::<StreamKind>().unwrap(),
            StreamKind::GroupUpdated
        );
        assert!("gossip".parse::<StreamKind>().is_err());
    }

    #[test]
    fn env_parse() {
        assert_eq!("prod".parse::<Env>().unwrap(), Env::Production);
        assert_eq!("DEV".parse::<Env>().unwrap(), Env::Dev);
        assert!("staging".parse::<Env>().is_err());
    }

    #[test]
    fn consent_toggle() {
        assert_eq!(ConsentState::Unknown.toggled(), ConsentState::Allowed);
        assert_eq!(ConsentState::Allowed.toggled(), ConsentState::Denied);
        assert_eq!(ConsentState::Denied.toggled(), ConsentState::Allowed);
    }

    #[test]
    fn stream_event_accessors() {
        let event = StreamEvent::Message(text_message("gm"));
        assert_eq!(event.kind(), StreamKind::Message);
        assert_eq!(event.conversation_id().unwrap().as_str(), "c1");
        assert_eq!(event.sender().unwrap().as_str(), "alice");
        assert_eq!(event.payload_len(), 2);

        let consent = StreamEvent::Consent(ConsentRecord {
            entity_type: ConsentEntityType::InboxId,
            entity: "bob".into(),
            state: ConsentState::Allowed,
        });
        assert!(consent.conversation_id().is_none());
        assert!(consent.sender().is_none());
    }

    #[test]
    fn message_content_accessors() {
        let message = text_message("hello");
        assert_eq!(message.text(), Some("hello"));
        assert!(message.group_update().is_none());
    }

    #[test]
    fn stream_event_serializes_tagged() {
        let event = StreamEvent::Conversation(ConversationEvent {
            conversation_id: ConversationId::new("c9"),
            kind: ConversationKind::Dm,
            created_by: InboxId::new("bob"),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation");
        assert_eq!(json["kind"], "dm");
    }
}
