//! # fanout-types
//!
//! Value types shared by every fanout crate:
//! - [`InboxId`], [`InstallationId`], [`ConversationId`], [`MessageId`], [`Address`] - identity handles
//! - [`StreamEvent`], [`Message`], [`ConversationKind`] - what protocol clients hand back
//! - [`NetworkConditions`], [`ChaosLevel`] - per-worker fault profiles
//! - [`ParseError`], [`ConditionsError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod conditions;
mod error;
mod events;
mod ids;

pub use conditions::{ChaosLevel, ChaosPreset, NetworkConditions};
pub use error::{ConditionsError, ParseError};
pub use events::{
    ConsentEntityType, ConsentRecord, ConsentState, ConversationEvent, ConversationKind,
    DebugInfo, Env, GroupUpdate, Member, Message, MessageContent, MetadataFieldChange,
    StreamEvent, StreamKind,
};
pub use ids::{Address, ConversationId, InboxId, InstallationId, MessageId};
