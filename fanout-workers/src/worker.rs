//! One simulated protocol identity.
//!
//! A [`Worker`] owns one protocol client, one local database and one
//! [`NetworkLink`]. Stream subscriptions run as background tasks that push
//! every received event, stamped with its arrival time, into a broadcast
//! channel; verification collectors subscribe to that channel.

use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use fanout_client::{
    ClientFactory, ClientOptions, Conversation, Identity, LinkStats, NetworkLink, ProtocolClient,
    RegisteredVersion,
};
use fanout_core::WorkerDescriptor;
use fanout_types::{
    Address, ConversationId, ConversationKind, Env, InboxId, InstallationId, NetworkConditions,
    StreamEvent, StreamKind,
};

use crate::config::WorkersConfig;
use crate::error::{Result, WorkerError};
use crate::keys::WorkerKeys;

/// Text a worker in [`ResponseMode::Gm`] replies with.
pub const GM_REPLY: &str = "gm";

/// Background conversation sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No background sync.
    #[default]
    None,
    /// Periodic `sync` (discover new conversations).
    Sync,
    /// Periodic `sync_all` (discover and sync every conversation).
    SyncAll,
    /// Both, one after the other.
    Both,
}

/// Automatic replies to incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Never reply.
    #[default]
    None,
    /// Reply "gm" to DMs and to group messages mentioning the worker.
    Gm,
}

// tokio::time::interval panics on a zero period
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Worker settings shared by every worker of a manager.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Deployment the clients talk to
    pub env: Env,
    /// Root directory for databases
    pub data_dir: PathBuf,
    /// Background sync
    pub sync_mode: SyncMode,
    /// Background sync period, at least 1ms
    pub sync_interval: Duration,
    /// Automatic replies
    pub response_mode: ResponseMode,
    /// Observed-event buffer per worker
    pub event_buffer: usize,
    /// Extra installations registered before the worker's own
    pub pre_install_count: usize,
}

impl WorkerSettings {
    /// Settings from the `[workers]` config section.
    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            env: config.env,
            data_dir: config.data_dir.clone(),
            sync_mode: SyncMode::None,
            sync_interval: Duration::from_millis(config.sync_interval_ms),
            response_mode: ResponseMode::None,
            event_buffer: config.event_buffer.max(1),
            pre_install_count: 0,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkersConfig::default())
    }
}

/// A stream event as seen by one worker.
#[derive(Debug, Clone)]
pub struct ObservedStreamEvent {
    /// The event
    pub event: StreamEvent,
    /// When the worker's subscription yielded it
    pub received_at: Instant,
}

/// Snapshot of a worker for logs and reports.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    /// Worker label
    pub name: String,
    /// SDK version in use
    pub sdk_version: String,
    /// Native library version in use
    pub lib_version: String,
    /// Account address
    pub address: Address,
    /// Inbox
    pub inbox_id: InboxId,
    /// Current installation, if initialized
    pub installation_id: Option<InstallationId>,
    /// Current network profile
    pub conditions: String,
    /// Running subscriptions
    pub active_streams: Vec<StreamKind>,
    /// What the link did so far
    pub link: LinkStats,
}

#[derive(Default)]
struct Tasks {
    streams: BTreeMap<StreamKind, JoinHandle<()>>,
    sync: Option<JoinHandle<()>>,
}

/// One identity + installation bound to one protocol client.
pub struct Worker {
    name: String,
    descriptor: WorkerDescriptor,
    identity: Identity,
    keys: WorkerKeys,
    address: Address,
    inbox_id: InboxId,
    db_path: PathBuf,
    sdk_version: String,
    lib_version: String,
    factory: Arc<dyn ClientFactory>,
    link: NetworkLink,
    settings: WorkerSettings,
    events: broadcast::Sender<ObservedStreamEvent>,
    client: RwLock<Option<Arc<dyn ProtocolClient>>>,
    tasks: Mutex<Tasks>,
    requested_streams: Mutex<BTreeSet<StreamKind>>,
    pre_installed: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("inbox_id", &self.inbox_id)
            .field("sdk_version", &self.sdk_version)
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build an uninitialized worker. No network calls are made.
    pub fn new(
        descriptor: WorkerDescriptor,
        keys: WorkerKeys,
        version: &RegisteredVersion,
        link: NetworkLink,
        settings: WorkerSettings,
    ) -> Result<Self> {
        let name = descriptor.label();
        let identity = Identity::new(keys.wallet_key.clone());
        let provisioning = |source| WorkerError::Provisioning {
            name: name.clone(),
            source,
        };
        let address = identity.address().map_err(provisioning)?;
        let inbox_id = identity.inbox_id().map_err(provisioning)?;

        let db_path = settings.data_dir.join(settings.env.as_str()).join(format!(
            "{}-{}-{}.db3",
            descriptor.base_name, descriptor.installation, version.sdk_version
        ));
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        Ok(Self {
            name,
            descriptor,
            identity,
            keys,
            address,
            inbox_id,
            db_path,
            sdk_version: version.sdk_version.clone(),
            lib_version: version.lib_version.clone(),
            factory: version.factory.clone(),
            link,
            settings,
            events,
            client: RwLock::new(None),
            tasks: Mutex::new(Tasks::default()),
            requested_streams: Mutex::new(BTreeSet::new()),
            pre_installed: AtomicBool::new(false),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Worker label: base name, plus the installation when it is not `a`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed descriptor.
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    /// Logical identity shared by every installation.
    pub fn base_name(&self) -> &str {
        &self.descriptor.base_name
    }

    /// Installation suffix.
    pub fn installation(&self) -> &str {
        &self.descriptor.installation
    }

    /// Account address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Inbox id.
    pub fn inbox_id(&self) -> &InboxId {
        &self.inbox_id
    }

    /// Installation id of the live client.
    pub fn installation_id(&self) -> Option<InstallationId> {
        self.current_client()
            .map(|client| client.installation_id().clone())
    }

    /// SDK version in use.
    pub fn sdk_version(&self) -> &str {
        &self.sdk_version
    }

    /// Native library version in use.
    pub fn lib_version(&self) -> &str {
        &self.lib_version
    }

    /// Local database location.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The worker's network link.
    pub fn link(&self) -> &NetworkLink {
        &self.link
    }

    /// Current network profile.
    pub fn network_conditions(&self) -> NetworkConditions {
        self.link.conditions()
    }

    /// Settings the worker was built with.
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    fn current_client(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requested(&self) -> MutexGuard<'_, BTreeSet<StreamKind>> {
        self.requested_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The live client.
    pub fn client(&self) -> Result<Arc<dyn ProtocolClient>> {
        self.current_client()
            .ok_or_else(|| WorkerError::NotInitialized(self.name.clone()))
    }

    /// True while a client is attached.
    pub fn is_initialized(&self) -> bool {
        self.current_client().is_some()
    }

    /// Subscriptions currently running.
    pub fn active_streams(&self) -> Vec<StreamKind> {
        self.tasks()
            .streams
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Summary for logs and reports.
    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            name: self.name.clone(),
            sdk_version: self.sdk_version.clone(),
            lib_version: self.lib_version.clone(),
            address: self.address.clone(),
            inbox_id: self.inbox_id.clone(),
            installation_id: self.installation_id(),
            conditions: self.network_conditions().to_string(),
            active_streams: self.active_streams(),
            link: self.link.stats(),
        }
    }

    fn client_options(&self, db_path: &Path) -> ClientOptions {
        ClientOptions {
            env: self.settings.env,
            db_path: db_path.to_path_buf(),
            db_encryption_key: self.keys.db_encryption_key.clone(),
            sdk_version: self.sdk_version.clone(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create (or reopen) the client, sync once and start the requested
    /// subscriptions. Does nothing if already initialized.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if !self.pre_installed.swap(true, Ordering::AcqRel) {
            self.pre_install().await?;
        }

        let client = self
            .factory
            .create(
                &self.identity,
                &self.client_options(&self.db_path),
                self.link.clone(),
            )
            .await
            .map_err(|source| WorkerError::Provisioning {
                name: self.name.clone(),
                source,
            })?;

        if let Err(err) = client.sync().await {
            client.close().await;
            return Err(err.into());
        }

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());
        tracing::info!(
            worker = %self.name,
            inbox = ?self.inbox_id,
            installation = ?client.installation_id(),
            sdk = %self.sdk_version,
            "worker initialized"
        );

        self.start_sync_loop(client);
        let requested: Vec<StreamKind> = self.requested().iter().copied().collect();
        for kind in requested {
            self.start_stream(kind).await?;
        }
        Ok(())
    }

    async fn pre_install(&self) -> Result<()> {
        for index in 0..self.settings.pre_install_count {
            let path = self.db_path.with_extension(format!("pre{}.db3", index));
            let client = self
                .factory
                .create(&self.identity, &self.client_options(&path), self.link.clone())
                .await
                .map_err(|source| WorkerError::Provisioning {
                    name: self.name.clone(),
                    source,
                })?;
            tracing::debug!(
                worker = %self.name,
                installation = ?client.installation_id(),
                "pre-installed"
            );
            client.close().await;
        }
        Ok(())
    }

    /// Stop every subscription, then release the client. With
    /// `drop_database` the local database is discarded as well.
    pub async fn terminate(&self, drop_database: bool) -> Result<()> {
        let (streams, sync) = {
            let mut tasks = self.tasks();
            (std::mem::take(&mut tasks.streams), tasks.sync.take())
        };
        for handle in streams.into_values().chain(sync) {
            handle.abort();
            let _ = handle.await;
        }

        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            client.close().await;
        }

        if drop_database {
            self.factory.drop_database(&self.db_path).await?;
        }
        tracing::info!(worker = %self.name, drop_database, "worker terminated");
        Ok(())
    }

    /// Terminate and discard the local database.
    pub async fn clear_db(&self) -> Result<()> {
        self.terminate(true).await
    }

    /// Start over with a fresh database and installation, keeping the
    /// identity and the requested subscriptions.
    pub async fn reinstall(&self) -> Result<()> {
        let previous = self.installation_id();
        self.clear_db().await?;
        self.initialize().await?;
        tracing::info!(
            worker = %self.name,
            from = ?previous,
            to = ?self.installation_id(),
            "worker reinstalled"
        );
        Ok(())
    }

    /// Discover and sync every conversation.
    pub async fn sync_all(&self) -> Result<usize> {
        Ok(self.client()?.sync_all().await?)
    }

    /// Look up a conversation, syncing once if it is not known locally yet.
    pub async fn conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Arc<dyn Conversation>>> {
        let client = self.client()?;
        if let Some(conversation) = client.conversation_by_id(id).await? {
            return Ok(Some(conversation));
        }
        client.sync().await?;
        Ok(client.conversation_by_id(id).await?)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Receive every event observed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ObservedStreamEvent> {
        self.events.subscribe()
    }

    /// Start a subscription. Registration with the client is complete when
    /// this returns; the kind is restarted on every later `initialize`.
    pub async fn start_stream(&self, kind: StreamKind) -> Result<()> {
        self.requested().insert(kind);
        let client = self.client()?;
        if self.active_streams().contains(&kind) {
            return Ok(());
        }

        let mut stream = client.stream(kind).await?;
        let tx = self.events.clone();
        let name = self.name.clone();
        let responder = (self.settings.response_mode == ResponseMode::Gm
            && kind == StreamKind::Message)
            .then(|| Responder {
                client: client.clone(),
                mention: self.descriptor.base_name.to_ascii_lowercase(),
                name: self.name.clone(),
            });

        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let received_at = Instant::now();
                let reply_to = responder.as_ref().map(|_| event.clone());
                let _ = tx.send(ObservedStreamEvent { event, received_at });
                if let (Some(responder), Some(event)) = (&responder, reply_to) {
                    responder.respond(&event).await;
                }
            }
            tracing::debug!(worker = %name, %kind, "stream ended");
        });

        if let Some(previous) = self.tasks().streams.insert(kind, handle) {
            previous.abort();
        }
        tracing::debug!(worker = %self.name, %kind, "stream started");
        Ok(())
    }

    /// Stop one subscription and forget it.
    pub async fn stop_stream(&self, kind: StreamKind) {
        self.requested().remove(&kind);
        let handle = self.tasks().streams.remove(&kind);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn start_sync_loop(&self, client: Arc<dyn ProtocolClient>) {
        let mode = self.settings.sync_mode;
        if mode == SyncMode::None {
            return;
        }
        let interval = self.settings.sync_interval.max(MIN_SYNC_INTERVAL);
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if matches!(mode, SyncMode::Sync | SyncMode::Both) {
                    if let Err(err) = client.sync().await {
                        tracing::debug!(worker = %name, error = %err, "background sync failed");
                    }
                }
                if matches!(mode, SyncMode::SyncAll | SyncMode::Both) {
                    if let Err(err) = client.sync_all().await {
                        tracing::debug!(worker = %name, error = %err, "background sync_all failed");
                    }
                }
            }
        });

        if let Some(previous) = self.tasks().sync.replace(handle) {
            previous.abort();
        }
    }
}

struct Responder {
    client: Arc<dyn ProtocolClient>,
    mention: String,
    name: String,
}

impl Responder {
    async fn respond(&self, event: &StreamEvent) {
        let StreamEvent::Message(message) = event else {
            return;
        };
        let Some(text) = message.text() else {
            return;
        };
        if message.sender_inbox_id == *self.client.inbox_id() || text == GM_REPLY {
            return;
        }

        let conversation = match self.client.conversation_by_id(&message.conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => match self.client.sync().await {
                Ok(()) => match self.client.conversation_by_id(&message.conversation_id).await {
                    Ok(Some(conversation)) => conversation,
                    _ => return,
                },
                Err(_) => return,
            },
            Err(_) => return,
        };

        let mentioned = text.to_ascii_lowercase().contains(&self.mention);
        if conversation.kind() != ConversationKind::Dm && !mentioned {
            return;
        }
        if let Err(err) = conversation.send(GM_REPLY).await {
            tracing::warn!(worker = %self.name, error = %err, "failed to reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyCache;
    use fanout_client::{ClientError, GroupOptions, MemoryNetwork};

    fn worker(network: &MemoryNetwork, keys: &KeyCache, name: &str, settings: WorkerSettings) -> Worker {
        let registry = network.registry();
        let descriptor = WorkerDescriptor::parse(name, &registry.versions()).unwrap();
        let version = registry.resolve(descriptor.sdk_version.as_deref()).unwrap();
        Worker::new(
            descriptor.clone(),
            keys.get(&descriptor.base_name),
            version,
            NetworkLink::with_seed(name, 7),
            settings,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        assert!(matches!(alice.client(), Err(WorkerError::NotInitialized(_))));

        alice.initialize().await.unwrap();
        let installation = alice.installation_id().unwrap();
        alice.initialize().await.unwrap();
        assert_eq!(alice.installation_id().unwrap(), installation);
    }

    #[tokio::test]
    async fn installations_share_inbox_but_not_database() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let a = worker(&network, &keys, "alice", WorkerSettings::default());
        let b = worker(&network, &keys, "alice-b", WorkerSettings::default());
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        assert_eq!(a.inbox_id(), b.inbox_id());
        assert_ne!(a.db_path(), b.db_path());
        assert_ne!(a.installation_id(), b.installation_id());
        assert_eq!(b.name(), "alice-b");
    }

    #[tokio::test]
    async fn terminate_closes_streams_and_reinitialize_restarts_them() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        alice.initialize().await.unwrap();
        alice.start_stream(StreamKind::Message).await.unwrap();
        alice.start_stream(StreamKind::Consent).await.unwrap();
        assert_eq!(network.subscriber_count(), 2);

        alice.terminate(false).await.unwrap();
        assert!(alice.active_streams().is_empty());
        assert_eq!(network.subscriber_count(), 0);
        assert!(network.database_exists(alice.db_path()));

        alice.initialize().await.unwrap();
        assert_eq!(
            alice.active_streams(),
            vec![StreamKind::Message, StreamKind::Consent]
        );
    }

    #[tokio::test]
    async fn reinstall_creates_new_installation() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        alice.initialize().await.unwrap();
        let before = alice.installation_id().unwrap();

        alice.reinstall().await.unwrap();
        let after = alice.installation_id().unwrap();
        assert_ne!(before, after);
        assert_eq!(network.installations_of(alice.inbox_id()), vec![after]);
    }

    #[tokio::test]
    async fn pre_install_registers_extra_installations() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let settings = WorkerSettings {
            pre_install_count: 2,
            ..WorkerSettings::default()
        };
        let alice = worker(&network, &keys, "alice", settings);
        alice.initialize().await.unwrap();
        assert_eq!(network.installations_of(alice.inbox_id()).len(), 3);
    }

    #[tokio::test]
    async fn bad_wallet_key_is_provisioning_error() {
        let network = MemoryNetwork::new();
        let registry = network.registry();
        let keys = WorkerKeys {
            wallet_key: "not-a-key".into(),
            db_encryption_key: "00".repeat(32),
        };
        let err = Worker::new(
            WorkerDescriptor::new("mallory"),
            keys,
            registry.latest().unwrap(),
            NetworkLink::new("mallory"),
            WorkerSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Provisioning {
                source: ClientError::InvalidCredentials(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn gm_mode_replies_to_dms() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        let bot = worker(
            &network,
            &keys,
            "bot",
            WorkerSettings {
                response_mode: ResponseMode::Gm,
                ..WorkerSettings::default()
            },
        );
        alice.initialize().await.unwrap();
        bot.initialize().await.unwrap();
        bot.start_stream(StreamKind::Message).await.unwrap();
        alice.start_stream(StreamKind::Message).await.unwrap();
        let mut observed = alice.subscribe();

        let dm = alice.client().unwrap().new_dm(bot.inbox_id()).await.unwrap();
        dm.send("hello bot").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let seen = observed.recv().await.unwrap();
                if let StreamEvent::Message(m) = seen.event {
                    if m.sender_inbox_id == *bot.inbox_id() {
                        return m;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reply.text(), Some(GM_REPLY));
    }

    #[tokio::test]
    async fn gm_mode_ignores_unmentioned_group_messages() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        let bot = worker(
            &network,
            &keys,
            "bot",
            WorkerSettings {
                response_mode: ResponseMode::Gm,
                ..WorkerSettings::default()
            },
        );
        alice.initialize().await.unwrap();
        bot.initialize().await.unwrap();
        bot.start_stream(StreamKind::Message).await.unwrap();

        let group = alice
            .client()
            .unwrap()
            .new_group(&[bot.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        group.send("nothing to see").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(group.messages().await.unwrap().len(), 2);

        group.send("hey bot, you there?").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let messages = group.messages().await.unwrap();
        assert_eq!(messages.last().and_then(|m| m.text()), Some(GM_REPLY));
    }

    #[tokio::test]
    async fn zero_sync_interval_still_syncs() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        let bob = worker(
            &network,
            &keys,
            "bob",
            WorkerSettings {
                sync_mode: SyncMode::SyncAll,
                sync_interval: Duration::ZERO,
                ..WorkerSettings::default()
            },
        );
        alice.initialize().await.unwrap();
        bob.initialize().await.unwrap();

        let group = alice
            .client()
            .unwrap()
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = bob
            .client()
            .unwrap()
            .conversation_by_id(group.id())
            .await
            .unwrap();
        assert!(seen.is_some());
        bob.terminate(false).await.unwrap();
    }

    #[tokio::test]
    async fn background_sync_discovers_groups() {
        let network = MemoryNetwork::new();
        let keys = KeyCache::generated();
        let alice = worker(&network, &keys, "alice", WorkerSettings::default());
        let bob = worker(
            &network,
            &keys,
            "bob",
            WorkerSettings {
                sync_mode: SyncMode::Sync,
                sync_interval: Duration::from_millis(20),
                ..WorkerSettings::default()
            },
        );
        alice.initialize().await.unwrap();
        bob.initialize().await.unwrap();

        let group = alice
            .client()
            .unwrap()
            .new_group(&[bob.inbox_id().clone()], GroupOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = bob
            .client()
            .unwrap()
            .conversation_by_id(group.id())
            .await
            .unwrap();
        assert!(seen.is_some());
    }
}
