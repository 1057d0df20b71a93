//! In-process protocol backend.
//!
//! `MemoryNetwork` stands in for the real messaging network and SDK. It keeps
//! a canonical record per conversation (members, epoch, message log) and a
//! local view per installation database. Local views only move forward on
//! sync, so a member that misses a sync lags behind until it catches up.
//!
//! Fault knobs for tests:
//! - [`MemoryNetwork::fail_next_create`] fails the next client construction
//! - [`MemoryNetwork::corrupt_database`] makes a database unopenable
//! - [`MemoryNetwork::inject_fork`] marks one installation's view as forked
//!
//! A forked view stops following commits, its author's messages only reach
//! its own inbox, and it receives no stream events for that conversation.
//! A non-persistent fork heals once the member is removed and re-added.

mod client;
mod conversation;

use async_trait::async_trait;
use rand::RngCore;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use fanout_types::{
    Address, ConsentEntityType, ConsentRecord, ConsentState, ConversationEvent, ConversationId,
    ConversationKind, DebugInfo, GroupUpdate, InboxId, InstallationId, Member, Message,
    MessageContent, MessageId, MetadataFieldChange, StreamEvent, StreamKind,
};

use crate::client::{
    decode_key, ClientError, ClientOptions, GroupOptions, Identity, PermissionPolicy,
    ProtocolClient,
};
use crate::link::NetworkLink;
use crate::registry::{ClientFactory, VersionRegistry};

pub use client::MemoryClient;
pub use conversation::MemoryConversation;

/// SDK bindings the in-memory registry offers, oldest first: `(sdk, lib)`.
pub const SDK_VERSIONS: &[(&str, &str)] = &[
    ("4.0.3", "1.2.10"),
    ("4.1.0", "1.3.1"),
    ("4.2.3", "1.3.5"),
    ("4.2.6", "1.3.7"),
    ("4.5.0", "1.4.2"),
];

/// Metadata field changed by [`crate::Conversation::update_name`].
pub const GROUP_NAME_FIELD: &str = "group_name";

/// Shared in-process network. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

#[derive(Debug, Default)]
struct NetState {
    inboxes: HashMap<InboxId, InboxRecord>,
    databases: HashMap<PathBuf, Database>,
    conversations: HashMap<ConversationId, ConversationRecord>,
    subscribers: Vec<Subscriber>,
    next_client: u64,
    next_seq: u64,
    fail_next_create: Option<String>,
}

#[derive(Debug)]
struct InboxRecord {
    installations: BTreeSet<InstallationId>,
    consent: HashMap<(ConsentEntityType, String), ConsentState>,
}

#[derive(Debug)]
struct Database {
    inbox_id: InboxId,
    installation_id: InstallationId,
    encryption_key: [u8; 32],
    corrupted: Option<String>,
    views: HashMap<ConversationId, LocalView>,
}

#[derive(Debug, Clone)]
struct LocalView {
    epoch: u64,
    members: BTreeSet<InboxId>,
    name: String,
    fork: Option<ForkMark>,
}

#[derive(Debug, Clone, Copy)]
struct ForkMark {
    persistent: bool,
    log_len: usize,
}

#[derive(Debug)]
struct ConversationRecord {
    kind: ConversationKind,
    seq: u64,
    name: String,
    created_by: InboxId,
    permissions: PermissionPolicy,
    members: BTreeSet<InboxId>,
    epoch: u64,
    log: Vec<LogEntry>,
}

#[derive(Debug)]
struct LogEntry {
    message: Message,
    // Set when the author's view was forked
    only_visible_to: Option<InboxId>,
}

#[derive(Debug)]
struct Subscriber {
    client: u64,
    inbox: InboxId,
    db_path: PathBuf,
    kind: StreamKind,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

/// Identity of one open client, used by client and conversation handles.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) client: u64,
    pub(crate) inbox_id: InboxId,
    pub(crate) installation_id: InstallationId,
    pub(crate) db_path: PathBuf,
    pub(crate) link: NetworkLink,
    pub(crate) closed: Arc<AtomicBool>,
}

impl LocalView {
    fn of(record: &ConversationRecord) -> Self {
        Self {
            epoch: record.epoch,
            members: record.members.clone(),
            name: record.name.clone(),
            fork: None,
        }
    }

    fn refresh(&mut self, record: &ConversationRecord) {
        if self.fork.is_none() {
            self.epoch = record.epoch;
            self.members = record.members.clone();
            self.name = record.name.clone();
        }
    }
}

impl NetState {
    fn view(&self, db_path: &Path, id: &ConversationId) -> Result<&LocalView, ClientError> {
        self.databases
            .get(db_path)
            .and_then(|db| db.views.get(id))
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))
    }

    fn record(&self, id: &ConversationId) -> Result<&ConversationRecord, ClientError> {
        self.conversations
            .get(id)
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))
    }

    fn is_forked(&self, db_path: &Path, id: &ConversationId) -> bool {
        self.databases
            .get(db_path)
            .and_then(|db| db.views.get(id))
            .is_some_and(|view| view.fork.is_some())
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Push `event` to every live subscriber of `kind` that `accept`s it.
    fn fan_out(
        &mut self,
        kind: StreamKind,
        event: &StreamEvent,
        accept: impl Fn(&NetState, &Subscriber) -> bool,
    ) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        let targets: Vec<mpsc::UnboundedSender<StreamEvent>> = self
            .subscribers
            .iter()
            .filter(|s| s.kind == kind && accept(self, s))
            .map(|s| s.tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(event.clone());
        }
    }

    fn announce(&mut self, record_id: &ConversationId, to: &BTreeSet<InboxId>) {
        let Some(record) = self.conversations.get(record_id) else {
            return;
        };
        let event = StreamEvent::Conversation(ConversationEvent {
            conversation_id: record_id.clone(),
            kind: record.kind,
            created_by: record.created_by.clone(),
        });
        self.fan_out(StreamKind::Conversation, &event, |_, s| to.contains(&s.inbox));
    }

    /// Apply a commit: bump the epoch, log it, update the author's view and
    /// notify members (including any just removed).
    fn commit(
        &mut self,
        session: &Session,
        id: &ConversationId,
        update: GroupUpdate,
    ) -> Result<u64, ClientError> {
        let removed: BTreeSet<InboxId> = update.removed_inboxes.iter().cloned().collect();
        let record = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))?;
        record.epoch += 1;
        let epoch = record.epoch;
        let message = Message {
            id: MessageId::new(),
            conversation_id: id.clone(),
            sender_inbox_id: session.inbox_id.clone(),
            content: MessageContent::GroupUpdated(update),
            epoch,
            sent_at_ns: now_ns(),
        };
        record.log.push(LogEntry {
            message: message.clone(),
            only_visible_to: None,
        });
        let audience: BTreeSet<InboxId> = record.members.union(&removed).cloned().collect();

        let Self {
            databases,
            conversations,
            ..
        } = &mut *self;
        if let (Some(db), Some(record)) = (databases.get_mut(&session.db_path), conversations.get(id))
        {
            match db.views.get_mut(id) {
                Some(view) if view.fork.is_some() => view.epoch += 1,
                Some(view) => view.refresh(record),
                None => {
                    db.views.insert(id.clone(), LocalView::of(record));
                }
            }
        }

        let event = StreamEvent::GroupUpdated(message);
        self.fan_out(StreamKind::GroupUpdated, &event, |state, s| {
            audience.contains(&s.inbox) && !state.is_forked(&s.db_path, id)
        });
        Ok(epoch)
    }

    /// Drop the views `inboxes` hold of `id`, except persistent forks.
    fn forget_views(&mut self, id: &ConversationId, inboxes: &BTreeSet<InboxId>) {
        for db in self.databases.values_mut() {
            if inboxes.contains(&db.inbox_id) {
                let persistent = db
                    .views
                    .get(id)
                    .and_then(|v| v.fork)
                    .is_some_and(|f| f.persistent);
                if !persistent {
                    db.views.remove(id);
                }
            }
        }
    }

    fn check_inboxes(&self, inbox_ids: &[InboxId]) -> Result<(), ClientError> {
        match inbox_ids.iter().find(|id| !self.inboxes.contains_key(id)) {
            Some(missing) => Err(ClientError::InboxNotFound(missing.clone())),
            None => Ok(()),
        }
    }

    fn check_can_manage(&self, session: &Session, id: &ConversationId) -> Result<(), ClientError> {
        let record = self.record(id)?;
        if !record.members.contains(&session.inbox_id) {
            return Err(ClientError::NotMember {
                inbox: session.inbox_id.clone(),
                conversation: id.clone(),
            });
        }
        if record.kind == ConversationKind::Dm {
            return Err(ClientError::PermissionDenied(
                "dm membership and metadata are fixed".into(),
            ));
        }
        if record.permissions == PermissionPolicy::AdminOnly && record.created_by != session.inbox_id
        {
            return Err(ClientError::PermissionDenied(format!(
                "{} is not an admin of {}",
                session.inbox_id, id
            )));
        }
        Ok(())
    }
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Factory for one SDK binding on this network.
    pub fn factory(
        &self,
        sdk_version: impl Into<String>,
        lib_version: impl Into<String>,
    ) -> Arc<dyn ClientFactory> {
        Arc::new(MemoryFactory {
            network: self.clone(),
            sdk_version: sdk_version.into(),
            lib_version: lib_version.into(),
        })
    }

    /// Registry with every binding in [`SDK_VERSIONS`].
    pub fn registry(&self) -> VersionRegistry {
        SDK_VERSIONS
            .iter()
            .fold(VersionRegistry::new(), |registry, (sdk, lib)| {
                registry.register(*sdk, *lib, self.factory(*sdk, *lib))
            })
    }

    /// Make the next client construction fail with `reason`.
    pub fn fail_next_create(&self, reason: &str) {
        self.lock().fail_next_create = Some(reason.to_string());
    }

    /// Mark the database at `db_path` as unopenable.
    pub fn corrupt_database(&self, db_path: &Path) -> bool {
        match self.lock().databases.get_mut(db_path) {
            Some(db) => {
                db.corrupted = Some("malformed database header".into());
                true
            }
            None => false,
        }
    }

    /// Fork the view the installation at `db_path` holds of `id`.
    pub fn inject_fork(
        &self,
        db_path: &Path,
        id: &ConversationId,
        persistent: bool,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        let log_len = state.record(id)?.log.len();
        let view = state
            .databases
            .get_mut(db_path)
            .and_then(|db| db.views.get_mut(id))
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))?;
        view.fork = Some(ForkMark {
            persistent,
            log_len,
        });
        tracing::warn!(conversation = %id, db = %db_path.display(), persistent, "fork injected");
        Ok(())
    }

    /// Provision an identity that has no client.
    pub fn register_inbox(&self) -> InboxId {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let inbox_id = InboxId::derive(&Address::from_wallet_key(&key), 0);
        self.lock().inboxes.insert(
            inbox_id.clone(),
            InboxRecord {
                installations: BTreeSet::new(),
                consent: HashMap::new(),
            },
        );
        inbox_id
    }

    /// Canonical epoch of a conversation.
    pub fn conversation_epoch(&self, id: &ConversationId) -> Option<u64> {
        self.lock().conversations.get(id).map(|r| r.epoch)
    }

    /// Canonical member set of a conversation.
    pub fn members_of(&self, id: &ConversationId) -> Option<BTreeSet<InboxId>> {
        self.lock().conversations.get(id).map(|r| r.members.clone())
    }

    /// Installations registered for an inbox.
    pub fn installations_of(&self, inbox_id: &InboxId) -> Vec<InstallationId> {
        self.lock()
            .inboxes
            .get(inbox_id)
            .map(|r| r.installations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True if a database exists at `db_path`.
    pub fn database_exists(&self, db_path: &Path) -> bool {
        self.lock().databases.contains_key(db_path)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    fn open(
        &self,
        identity: &Identity,
        options: &ClientOptions,
        link: NetworkLink,
    ) -> Result<Session, ClientError> {
        let wallet_key = identity.wallet_key_bytes()?;
        let encryption_key = decode_key("database encryption key", &options.db_encryption_key)?;
        let inbox_id = InboxId::derive(&Address::from_wallet_key(&wallet_key), 0);

        let mut state = self.lock();
        if let Some(reason) = state.fail_next_create.take() {
            return Err(ClientError::Creation(reason));
        }

        let installation_id = match state.databases.get(&options.db_path) {
            Some(db) => {
                let reason = if let Some(reason) = &db.corrupted {
                    Some(reason.clone())
                } else if db.encryption_key != encryption_key {
                    Some("encryption key mismatch".to_string())
                } else if db.inbox_id != inbox_id {
                    Some(format!("database belongs to {}", db.inbox_id))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ClientError::DatabaseCorrupted {
                        path: options.db_path.clone(),
                        reason,
                    });
                }
                db.installation_id.clone()
            }
            None => {
                let installation_id = InstallationId::random();
                state.databases.insert(
                    options.db_path.clone(),
                    Database {
                        inbox_id: inbox_id.clone(),
                        installation_id: installation_id.clone(),
                        encryption_key,
                        corrupted: None,
                        views: HashMap::new(),
                    },
                );
                installation_id
            }
        };

        state
            .inboxes
            .entry(inbox_id.clone())
            .or_insert_with(|| InboxRecord {
                installations: BTreeSet::new(),
                consent: HashMap::new(),
            })
            .installations
            .insert(installation_id.clone());

        state.next_client += 1;
        Ok(Session {
            client: state.next_client,
            inbox_id,
            installation_id,
            db_path: options.db_path.clone(),
            link,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn drop_database(&self, db_path: &Path) {
        let mut state = self.lock();
        if let Some(db) = state.databases.remove(db_path) {
            if let Some(inbox) = state.inboxes.get_mut(&db.inbox_id) {
                inbox.installations.remove(&db.installation_id);
            }
            tracing::debug!(db = %db_path.display(), installation = ?db.installation_id, "database dropped");
        }
        state.subscribers.retain(|s| s.db_path != db_path);
    }

    fn close(&self, session: &Session) {
        self.lock().subscribers.retain(|s| s.client != session.client);
    }

    fn subscribe(&self, session: &Session, kind: StreamKind) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(Subscriber {
            client: session.client,
            inbox: session.inbox_id.clone(),
            db_path: session.db_path.clone(),
            kind,
            tx,
        });
        rx
    }

    /// Create views for conversations this inbox joined. Returns the number
    /// of views the database holds afterwards.
    fn discover(&self, session: &Session, refresh: bool) -> Result<usize, ClientError> {
        let mut state = self.lock();
        let NetState {
            databases,
            conversations,
            ..
        } = &mut *state;
        let db = databases
            .get_mut(&session.db_path)
            .ok_or(ClientError::Closed)?;
        for (id, record) in conversations.iter() {
            if !record.members.contains(&session.inbox_id) {
                continue;
            }
            match db.views.get_mut(id) {
                Some(view) if refresh => view.refresh(record),
                Some(_) => {}
                None => {
                    db.views.insert(id.clone(), LocalView::of(record));
                }
            }
        }
        Ok(db.views.len())
    }

    fn list(&self, session: &Session) -> Vec<(ConversationId, ConversationKind)> {
        let state = self.lock();
        let Some(db) = state.databases.get(&session.db_path) else {
            return Vec::new();
        };
        let mut known: Vec<(u64, ConversationId, ConversationKind)> = db
            .views
            .keys()
            .filter_map(|id| {
                let record = state.conversations.get(id)?;
                record
                    .members
                    .contains(&session.inbox_id)
                    .then(|| (record.seq, id.clone(), record.kind))
            })
            .collect();
        known.sort_by_key(|(seq, _, _)| *seq);
        known.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    fn lookup(&self, session: &Session, id: &ConversationId) -> Option<ConversationKind> {
        let state = self.lock();
        state.view(&session.db_path, id).ok()?;
        state.conversations.get(id).map(|r| r.kind)
    }

    fn new_group(
        &self,
        session: &Session,
        members: &[InboxId],
        options: GroupOptions,
    ) -> Result<ConversationId, ClientError> {
        let mut state = self.lock();
        state.check_inboxes(members)?;

        let id = ConversationId::random();
        let seq = state.next_seq();
        let record = ConversationRecord {
            kind: ConversationKind::Group,
            seq,
            name: options.name.unwrap_or_default(),
            created_by: session.inbox_id.clone(),
            permissions: options.permissions,
            members: BTreeSet::from([session.inbox_id.clone()]),
            epoch: 0,
            log: Vec::new(),
        };
        if let Some(db) = state.databases.get_mut(&session.db_path) {
            db.views.insert(id.clone(), LocalView::of(&record));
        }
        state.conversations.insert(id.clone(), record);

        let added: BTreeSet<InboxId> = members
            .iter()
            .filter(|m| **m != session.inbox_id)
            .cloned()
            .collect();
        if !added.is_empty() {
            if let Some(record) = state.conversations.get_mut(&id) {
                record.members.extend(added.iter().cloned());
            }
            state.commit(
                session,
                &id,
                GroupUpdate {
                    initiated_by: Some(session.inbox_id.clone()),
                    added_inboxes: added.iter().cloned().collect(),
                    ..GroupUpdate::default()
                },
            )?;
            state.announce(&id, &added);
        }
        tracing::debug!(conversation = %id, members = added.len() + 1, "group created");
        Ok(id)
    }

    fn new_dm(&self, session: &Session, peer: &InboxId) -> Result<ConversationId, ClientError> {
        let mut state = self.lock();
        state.check_inboxes(std::slice::from_ref(peer))?;
        if *peer == session.inbox_id {
            return Err(ClientError::PermissionDenied("cannot open a dm with yourself".into()));
        }

        let pair = BTreeSet::from([session.inbox_id.clone(), peer.clone()]);
        let existing = state
            .conversations
            .iter()
            .find(|(_, r)| r.kind == ConversationKind::Dm && r.members == pair)
            .map(|(id, r)| (id.clone(), LocalView::of(r)));
        if let Some((id, view)) = existing {
            if let Some(db) = state.databases.get_mut(&session.db_path) {
                db.views.entry(id.clone()).or_insert(view);
            }
            return Ok(id);
        }

        let id = ConversationId::random();
        let seq = state.next_seq();
        let record = ConversationRecord {
            kind: ConversationKind::Dm,
            seq,
            name: String::new(),
            created_by: session.inbox_id.clone(),
            permissions: PermissionPolicy::AllMembers,
            members: pair,
            epoch: 1,
            log: Vec::new(),
        };
        if let Some(db) = state.databases.get_mut(&session.db_path) {
            db.views.insert(id.clone(), LocalView::of(&record));
        }
        state.conversations.insert(id.clone(), record);
        state.announce(&id, &BTreeSet::from([peer.clone()]));
        Ok(id)
    }

    fn set_consent(&self, session: &Session, records: &[ConsentRecord]) -> Result<(), ClientError> {
        let mut state = self.lock();
        let inbox = state
            .inboxes
            .get_mut(&session.inbox_id)
            .ok_or_else(|| ClientError::InboxNotFound(session.inbox_id.clone()))?;
        for record in records {
            inbox
                .consent
                .insert((record.entity_type, record.entity.clone()), record.state);
        }
        for record in records {
            let event = StreamEvent::Consent(record.clone());
            state.fan_out(StreamKind::Consent, &event, |_, s| s.inbox == session.inbox_id);
        }
        Ok(())
    }

    fn consent(
        &self,
        session: &Session,
        entity_type: ConsentEntityType,
        entity: &str,
    ) -> ConsentState {
        self.lock()
            .inboxes
            .get(&session.inbox_id)
            .and_then(|inbox| inbox.consent.get(&(entity_type, entity.to_string())))
            .copied()
            .unwrap_or_default()
    }

    fn send(
        &self,
        session: &Session,
        id: &ConversationId,
        text: &str,
    ) -> Result<MessageId, ClientError> {
        let mut state = self.lock();
        let forked = state.is_forked(&session.db_path, id);
        let epoch = state.view(&session.db_path, id)?.epoch;
        let record = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))?;
        if !record.members.contains(&session.inbox_id) {
            return Err(ClientError::NotMember {
                inbox: session.inbox_id.clone(),
                conversation: id.clone(),
            });
        }

        let message = Message {
            id: MessageId::new(),
            conversation_id: id.clone(),
            sender_inbox_id: session.inbox_id.clone(),
            content: MessageContent::Text(text.to_string()),
            epoch,
            sent_at_ns: now_ns(),
        };
        let message_id = message.id;
        record.log.push(LogEntry {
            message: message.clone(),
            only_visible_to: forked.then(|| session.inbox_id.clone()),
        });
        let members = record.members.clone();

        let event = StreamEvent::Message(message);
        state.fan_out(StreamKind::Message, &event, |state, s| {
            if forked {
                s.inbox == session.inbox_id
            } else {
                members.contains(&s.inbox) && !state.is_forked(&s.db_path, id)
            }
        });
        Ok(message_id)
    }

    fn sync_conversation(&self, session: &Session, id: &ConversationId) -> Result<(), ClientError> {
        let mut state = self.lock();
        let NetState {
            databases,
            conversations,
            ..
        } = &mut *state;
        let record = conversations
            .get(id)
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))?;
        if !record.members.contains(&session.inbox_id) {
            return Err(ClientError::NotMember {
                inbox: session.inbox_id.clone(),
                conversation: id.clone(),
            });
        }
        let db = databases
            .get_mut(&session.db_path)
            .ok_or(ClientError::Closed)?;
        match db.views.get_mut(id) {
            Some(view) => view.refresh(record),
            None => {
                db.views.insert(id.clone(), LocalView::of(record));
            }
        }
        Ok(())
    }

    fn members(&self, session: &Session, id: &ConversationId) -> Result<Vec<Member>, ClientError> {
        let state = self.lock();
        let view = state.view(&session.db_path, id)?;
        Ok(view
            .members
            .iter()
            .map(|inbox_id| Member {
                inbox_id: inbox_id.clone(),
                installation_ids: state
                    .inboxes
                    .get(inbox_id)
                    .map(|r| r.installations.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    fn add_members(
        &self,
        session: &Session,
        id: &ConversationId,
        inbox_ids: &[InboxId],
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_can_manage(session, id)?;
        state.check_inboxes(inbox_ids)?;

        let record = state.record(id)?;
        let added: BTreeSet<InboxId> = inbox_ids
            .iter()
            .filter(|inbox| !record.members.contains(*inbox))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(());
        }

        state.forget_views(id, &added);
        if let Some(record) = state.conversations.get_mut(id) {
            record.members.extend(added.iter().cloned());
        }
        state.commit(
            session,
            id,
            GroupUpdate {
                initiated_by: Some(session.inbox_id.clone()),
                added_inboxes: added.iter().cloned().collect(),
                ..GroupUpdate::default()
            },
        )?;
        state.announce(id, &added);
        Ok(())
    }

    fn remove_members(
        &self,
        session: &Session,
        id: &ConversationId,
        inbox_ids: &[InboxId],
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_can_manage(session, id)?;

        let record = state.record(id)?;
        if inbox_ids.contains(&record.created_by) {
            return Err(ClientError::PermissionDenied(
                "the group creator cannot be removed".into(),
            ));
        }
        let removed: BTreeSet<InboxId> = inbox_ids
            .iter()
            .filter(|inbox| record.members.contains(*inbox))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(());
        }

        if let Some(record) = state.conversations.get_mut(id) {
            record.members.retain(|m| !removed.contains(m));
        }
        state.commit(
            session,
            id,
            GroupUpdate {
                initiated_by: Some(session.inbox_id.clone()),
                removed_inboxes: removed.iter().cloned().collect(),
                ..GroupUpdate::default()
            },
        )?;
        state.forget_views(id, &removed);
        Ok(())
    }

    fn update_name(
        &self,
        session: &Session,
        id: &ConversationId,
        name: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.check_can_manage(session, id)?;

        let record = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| ClientError::ConversationNotFound(id.clone()))?;
        let old_value = std::mem::replace(&mut record.name, name.to_string());
        state.commit(
            session,
            id,
            GroupUpdate {
                initiated_by: Some(session.inbox_id.clone()),
                metadata_field_changes: vec![MetadataFieldChange {
                    field_name: GROUP_NAME_FIELD.to_string(),
                    old_value: Some(old_value),
                    new_value: name.to_string(),
                }],
                ..GroupUpdate::default()
            },
        )?;
        Ok(())
    }

    fn name(&self, session: &Session, id: &ConversationId) -> Result<String, ClientError> {
        Ok(self.lock().view(&session.db_path, id)?.name.clone())
    }

    fn messages(&self, session: &Session, id: &ConversationId) -> Result<Vec<Message>, ClientError> {
        let state = self.lock();
        let view = state.view(&session.db_path, id)?;
        let record = state.record(id)?;
        let cutoff = view.fork.map(|f| f.log_len);
        Ok(record
            .log
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry
                    .only_visible_to
                    .as_ref()
                    .map_or(true, |inbox| *inbox == session.inbox_id)
            })
            .filter(|(index, entry)| {
                cutoff.map_or(true, |len| {
                    *index < len || entry.message.sender_inbox_id == session.inbox_id
                })
            })
            .map(|(_, entry)| entry.message.clone())
            .collect())
    }

    fn debug_info(&self, session: &Session, id: &ConversationId) -> Result<DebugInfo, ClientError> {
        let state = self.lock();
        let view = state.view(&session.db_path, id)?;
        Ok(DebugInfo {
            epoch: view.epoch,
            maybe_forked: view.fork.is_some(),
        })
    }

    fn can_manage_members(&self, session: &Session, id: &ConversationId) -> Result<bool, ClientError> {
        Ok(self.lock().check_can_manage(session, id).is_ok())
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// [`ClientFactory`] for one SDK binding on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryFactory {
    network: MemoryNetwork,
    sdk_version: String,
    lib_version: String,
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    async fn create(
        &self,
        identity: &Identity,
        options: &ClientOptions,
        link: NetworkLink,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        link.transmit(0).await?;
        let session = self.network.open(identity, options, link)?;
        let address = identity.address()?;
        tracing::debug!(
            inbox = ?session.inbox_id,
            installation = ?session.installation_id,
            sdk = %self.sdk_version,
            "client created"
        );
        Ok(Arc::new(MemoryClient::new(
            self.network.clone(),
            session,
            address,
            self.sdk_version.clone(),
            self.lib_version.clone(),
        )))
    }

    async fn drop_database(&self, db_path: &Path) -> Result<(), ClientError> {
        self.network.drop_database(db_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Conversation;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn key(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    async fn client(network: &MemoryNetwork, byte: u8, db: &str) -> Arc<dyn ProtocolClient> {
        let options = ClientOptions {
            env: Default::default(),
            db_path: PathBuf::from(db),
            db_encryption_key: key(0xEE),
            sdk_version: "4.5.0".into(),
        };
        network
            .factory("4.5.0", "1.4.2")
            .create(&Identity::new(key(byte)), &options, NetworkLink::with_seed(db, 1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn group_members_discover_on_sync() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let bob = client(&network, 2, "bob").await;

        let group = alice
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        assert_eq!(group.kind(), ConversationKind::Group);
        assert_eq!(group.debug_info().await.unwrap().epoch, 1);

        assert!(bob.conversation_by_id(group.id()).await.unwrap().is_none());
        bob.sync().await.unwrap();
        let seen = bob.conversation_by_id(group.id()).await.unwrap().unwrap();
        assert_eq!(seen.members().await.unwrap().len(), 2);
        assert_eq!(bob.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_stream_to_members() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let bob = client(&network, 2, "bob").await;
        let group = alice
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();

        let mut stream = bob.stream(StreamKind::Message).await.unwrap();
        group.send("hello").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.conversation_id(), Some(group.id()));
        assert!(matches!(event, StreamEvent::Message(m) if m.text() == Some("hello")));
    }

    #[tokio::test]
    async fn reopening_database_keeps_installation() {
        let network = MemoryNetwork::new();
        let first = client(&network, 1, "alice").await;
        let installation = first.installation_id().clone();
        first.close().await;

        let second = client(&network, 1, "alice").await;
        assert_eq!(*second.installation_id(), installation);

        network.drop_database(Path::new("alice"));
        let third = client(&network, 1, "alice").await;
        assert_ne!(*third.installation_id(), installation);
    }

    #[tokio::test]
    async fn corrupted_database_fails_creation() {
        let network = MemoryNetwork::new();
        client(&network, 1, "alice").await.close().await;
        assert!(network.corrupt_database(Path::new("alice")));

        let options = ClientOptions {
            env: Default::default(),
            db_path: PathBuf::from("alice"),
            db_encryption_key: key(0xEE),
            sdk_version: "4.5.0".into(),
        };
        let err = network
            .factory("4.5.0", "1.4.2")
            .create(&Identity::new(key(1)), &options, NetworkLink::new("alice"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::DatabaseCorrupted { .. }));
    }

    #[tokio::test]
    async fn fork_heals_after_readd() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let bob = client(&network, 2, "bob").await;
        let group = alice
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        bob.sync().await.unwrap();

        network
            .inject_fork(Path::new("bob"), group.id(), false)
            .unwrap();
        let bob_group = bob.conversation_by_id(group.id()).await.unwrap().unwrap();
        assert!(bob_group.debug_info().await.unwrap().maybe_forked);

        group.remove_members(&[bob.inbox_id().clone()]).await.unwrap();
        group.add_members(&[bob.inbox_id().clone()]).await.unwrap();
        bob_group.sync().await.unwrap();

        let info = bob_group.debug_info().await.unwrap();
        assert!(!info.maybe_forked);
        assert_eq!(info.epoch, network.conversation_epoch(group.id()).unwrap());
    }

    #[tokio::test]
    async fn persistent_fork_survives_readd() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let bob = client(&network, 2, "bob").await;
        let group = alice
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        bob.sync().await.unwrap();
        network.inject_fork(Path::new("bob"), group.id(), true).unwrap();

        group.remove_members(&[bob.inbox_id().clone()]).await.unwrap();
        group.add_members(&[bob.inbox_id().clone()]).await.unwrap();
        let bob_group = bob.conversation_by_id(group.id()).await.unwrap().unwrap();
        bob_group.sync().await.unwrap();
        assert!(bob_group.debug_info().await.unwrap().maybe_forked);
    }

    #[tokio::test]
    async fn creator_cannot_be_removed() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let bob = client(&network, 2, "bob").await;
        let group = alice
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        bob.sync().await.unwrap();
        let bob_group = bob.conversation_by_id(group.id()).await.unwrap().unwrap();

        let err = bob_group
            .remove_members(&[alice.inbox_id().clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn consent_reaches_own_installations() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice-a").await;
        let alice_b = client(&network, 1, "alice-b").await;
        let mut stream = alice_b.stream(StreamKind::Consent).await.unwrap();

        let record = ConsentRecord {
            entity_type: ConsentEntityType::ConversationId,
            entity: "group-1".into(),
            state: ConsentState::Denied,
        };
        alice.set_consent_states(&[record.clone()]).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, StreamEvent::Consent(record));
        assert_eq!(
            alice_b
                .consent_state(ConsentEntityType::ConversationId, "group-1")
                .await
                .unwrap(),
            ConsentState::Denied
        );
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let network = MemoryNetwork::new();
        let alice = client(&network, 1, "alice").await;
        let mut stream = alice.stream(StreamKind::Message).await.unwrap();
        assert_eq!(network.subscriber_count(), 1);

        alice.close().await;
        assert!(stream.next().await.is_none());
        assert_eq!(network.subscriber_count(), 0);
        assert!(matches!(alice.sync().await, Err(ClientError::Closed)));
    }
}
