use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use fanout_types::{
    Address, ConsentEntityType, ConsentRecord, ConsentState, ConversationId, ConversationKind,
    InboxId, InstallationId, StreamKind,
};

use super::{MemoryConversation, MemoryNetwork, Session};
use crate::client::{ClientError, Conversation, EventStream, GroupOptions, ProtocolClient};

const CONTROL_PAYLOAD: usize = 64;

/// A client of a [`MemoryNetwork`].
pub struct MemoryClient {
    network: MemoryNetwork,
    session: Session,
    address: Address,
    sdk_version: String,
    lib_version: String,
}

impl MemoryClient {
    pub(super) fn new(
        network: MemoryNetwork,
        session: Session,
        address: Address,
        sdk_version: String,
        lib_version: String,
    ) -> Self {
        Self {
            network,
            session,
            address,
            sdk_version,
            lib_version,
        }
    }

    fn handle(&self, id: ConversationId, kind: ConversationKind) -> Arc<dyn Conversation> {
        Arc::new(MemoryConversation::new(
            self.network.clone(),
            self.session.clone(),
            id,
            kind,
        ))
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
impl ProtocolClient for MemoryClient {
    fn inbox_id(&self) -> &InboxId {
        &self.session.inbox_id
    }

    fn installation_id(&self) -> &InstallationId {
        &self.session.installation_id
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn sdk_version(&self) -> &str {
        &self.sdk_version
    }

    fn lib_version(&self) -> &str {
        &self.lib_version
    }

    async fn sync(&self) -> Result<(), ClientError> {
        self.call(CONTROL_PAYLOAD).await?;
        self.network.discover(&self.session, false)?;
        Ok(())
    }

    async fn sync_all(&self) -> Result<usize, ClientError> {
        self.call(CONTROL_PAYLOAD).await?;
        self.network.discover(&self.session, true)
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Conversation>>, ClientError> {
        self.ensure_open()?;
        Ok(self
            .network
            .list(&self.session)
            .into_iter()
            .map(|(id, kind)| self.handle(id, kind))
            .collect())
    }

    async fn new_group(
        &self,
        members: &[InboxId],
        options: GroupOptions,
    ) -> Result<Arc<dyn Conversation>, ClientError> {
        self.call(CONTROL_PAYLOAD * (members.len() + 1)).await?;
        let id = self.network.new_group(&self.session, members, options)?;
        Ok(self.handle(id, ConversationKind::Group))
    }

    async fn new_dm(&self, peer: &InboxId) -> Result<Arc<dyn Conversation>, ClientError> {
        self.call(CONTROL_PAYLOAD).await?;
        let id = self.network.new_dm(&self.session, peer)?;
        Ok(self.handle(id, ConversationKind::Dm))
    }

    async fn conversation_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Arc<dyn Conversation>>, ClientError> {
        self.ensure_open()?;
        Ok(self
            .network
            .lookup(&self.session, id)
            .map(|kind| self.handle(id.clone(), kind)))
    }

    async fn stream(&self, kind: StreamKind) -> Result<EventStream, ClientError> {
        self.call(CONTROL_PAYLOAD).await?;
        let rx = self.network.subscribe(&self.session, kind);
        let link = self.session.link.clone();
        tracing::trace!(link = link.label(), kind = %kind, "stream registered");

        Ok(stream::unfold((rx, link), |(mut rx, link)| async move {
            loop {
                let event = rx.recv().await?;
                if link.deliver(event.payload_len()).await {
                    return Some((event, (rx, link)));
                }
                tracing::trace!(link = link.label(), "stream event dropped");
            }
        })
        .boxed())
    }

    async fn set_consent_states(&self, records: &[ConsentRecord]) -> Result<(), ClientError> {
        self.call(CONTROL_PAYLOAD * records.len().max(1)).await?;
        self.network.set_consent(&self.session, records)
    }

    async fn consent_state(
        &self,
        entity_type: ConsentEntityType,
        entity: &str,
    ) -> Result<ConsentState, ClientError> {
        self.ensure_open()?;
        Ok(self.network.consent(&self.session, entity_type, entity))
    }

    async fn close(&self) {
        if !self.session.closed.swap(true, Ordering::AcqRel) {
            self.network.close(&self.session);
        }
    }
}
