use async_trait::async_trait;
use std::sync::atomic::Ordering;

use fanout_types::{ConversationId, ConversationKind, DebugInfo, InboxId, Member, Message, MessageId};

use super::{MemoryNetwork, Session};
use crate::client::{ClientError, Conversation};

const COMMIT_PAYLOAD: usize = 64;

/// One installation's handle on a [`MemoryNetwork`] conversation.
pub struct MemoryConversation {
    network: MemoryNetwork,
    session: Session,
    id: ConversationId,
    kind: ConversationKind,
}

impl MemoryConversation {
    pub(super) fn new(
        network: MemoryNetwork,
        session: Session,
        id: ConversationId,
        kind: ConversationKind,
    ) -> Self {
        Self {
            network,
            session,
            id,
            kind,
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.session.closed.load(Ordering::Acquire) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    async fn call(&self, payload_len: usize) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.session.link.transmit(payload_len).await?;
        Ok(())
    }
}

#[async_trait]
impl Conversation for MemoryConversation {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn kind(&self) -> ConversationKind {
        self.kind
    }

    async fn send(&self, text: &str) -> Result<MessageId, ClientError> {
        self.call(text.len()).await?;
        self.network.send(&self.session, &self.id, text)
    }

    async fn sync(&self) -> Result<(), ClientError> {
        self.call(COMMIT_PAYLOAD).await?;
        self.network.sync_conversation(&self.session, &self.id)
    }

    async fn members(&self) -> Result<Vec<Member>, ClientError> {
        self.ensure_open()?;
        self.network.members(&self.session, &self.id)
    }

    async fn add_members(&self, inbox_ids: &[InboxId]) -> Result<(), ClientError> {
        self.call(COMMIT_PAYLOAD * inbox_ids.len().max(1)).await?;
        self.network.add_members(&self.session, &self.id, inbox_ids)
    }

    async fn remove_members(&self, inbox_ids: &[InboxId]) -> Result<(), ClientError> {
        self.call(COMMIT_PAYLOAD * inbox_ids.len().max(1)).await?;
        self.network.remove_members(&self.session, &self.id, inbox_ids)
    }

    async fn update_name(&self, name: &str) -> Result<(), ClientError> {
        self.call(COMMIT_PAYLOAD + name.len()).await?;
        self.network.update_name(&self.session, &self.id, name)
    }

    async fn name(&self) -> Result<String, ClientError> {
        self.ensure_open()?;
        self.network.name(&self.session, &self.id)
    }

    async fn messages(&self) -> Result<Vec<Message>, ClientError> {
        self.ensure_open()?;
        self.network.messages(&self.session, &self.id)
    }

    async fn debug_info(&self) -> Result<DebugInfo, ClientError> {
        self.ensure_open()?;
        self.network.debug_info(&self.session, &self.id)
    }

    async fn can_manage_members(&self) -> Result<bool, ClientError> {
        self.ensure_open()?;
        self.network.can_manage_members(&self.session, &self.id)
    }
}
