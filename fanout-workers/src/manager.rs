//! Worker manager.
//!
//! [`get_workers`] provisions a named, ordered set of workers: every worker
//! has a live client, has synced once and has its requested subscriptions
//! running before the call returns. A provisioning failure terminates the
//! workers already created and fails the whole call.
//!
//! The first worker is the *creator*, the second the *receiver*.

use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fanout_client::{Conversation, GroupOptions, NetworkLink, VersionRegistry};
use fanout_core::{default_names, WorkerDescriptor, DEFAULT_INSTALLATION, DEFAULT_NAMES};
use fanout_types::{ConversationId, ConversationKind, InboxId, NetworkConditions, StreamKind};

use crate::config::HarnessConfig;
use crate::error::{Result, WorkerError};
use crate::keys::KeyCache;
use crate::netem::{ChaosHandle, NetworkSimulator};
use crate::worker::{ResponseMode, SyncMode, Worker, WorkerSettings, WorkerSummary};

/// Which workers to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSelector {
    /// Explicit descriptors (`name[-installation[-sdkVersion]]`)
    Names(Vec<String>),
    /// The first `n` names of the default pool
    Count(usize),
}

impl From<usize> for WorkerSelector {
    fn from(count: usize) -> Self {
        WorkerSelector::Count(count)
    }
}

impl From<&[&str]> for WorkerSelector {
    fn from(names: &[&str]) -> Self {
        WorkerSelector::Names(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for WorkerSelector {
    fn from(names: [&str; N]) -> Self {
        WorkerSelector::Names(names.iter().map(|n| n.to_string()).collect())
    }
}

impl From<Vec<String>> for WorkerSelector {
    fn from(names: Vec<String>) -> Self {
        WorkerSelector::Names(names)
    }
}

/// Everything [`get_workers`] needs besides the selector.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// SDK bindings available to workers
    pub registry: VersionRegistry,
    /// Key material per identity
    pub keys: Arc<KeyCache>,
    /// Harness configuration
    pub config: HarnessConfig,
    /// Subscriptions started on every worker
    pub streams: Vec<StreamKind>,
    /// Automatic replies
    pub response_mode: ResponseMode,
    /// Background sync
    pub sync_mode: SyncMode,
    /// Profile applied to every worker once it is ready
    pub network: Option<NetworkConditions>,
    /// Extra installations per identity
    pub pre_install_count: usize,
    /// Version for descriptors that do not pin one; latest when unset
    pub sdk_version: Option<String>,
}

impl ManagerOptions {
    /// Defaults over `registry`.
    pub fn new(registry: VersionRegistry) -> Self {
        Self {
            registry,
            keys: Arc::new(KeyCache::from_env()),
            config: HarnessConfig::default(),
            streams: Vec::new(),
            response_mode: ResponseMode::None,
            sync_mode: SyncMode::None,
            network: None,
            pre_install_count: 0,
            sdk_version: None,
        }
    }

    /// Use `config`.
    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Share `keys`.
    pub fn with_keys(mut self, keys: Arc<KeyCache>) -> Self {
        self.keys = keys;
        self
    }

    /// Start `kind` on every worker.
    pub fn with_stream(mut self, kind: StreamKind) -> Self {
        if !self.streams.contains(&kind) {
            self.streams.push(kind);
        }
        self
    }

    /// Set the response mode.
    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    /// Set the sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Apply `conditions` to every worker.
    pub fn with_network(mut self, conditions: NetworkConditions) -> Self {
        self.network = Some(conditions);
        self
    }

    /// Register `count` extra installations per identity first.
    pub fn with_pre_install_count(mut self, count: usize) -> Self {
        self.pre_install_count = count;
        self
    }

    /// Default SDK version.
    pub fn with_sdk_version(mut self, version: impl Into<String>) -> Self {
        self.sdk_version = Some(version.into());
        self
    }
}

/// A positive fork flag found by [`WorkerManager::check_forks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkFlag {
    /// Worker holding the view
    pub worker: String,
    /// Group
    pub group: ConversationId,
    /// Worker's local epoch for the group
    pub epoch: u64,
}

/// Result of a fork probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForkScan {
    /// Group views inspected
    pub checked: usize,
    /// Views flagged as possibly forked, by worker then group
    pub forked: Vec<ForkFlag>,
}

impl ForkScan {
    /// True if any view is flagged.
    pub fn has_forks(&self) -> bool {
        !self.forked.is_empty()
    }
}

/// Provision workers for `test_name`.
pub async fn get_workers(
    selector: impl Into<WorkerSelector>,
    test_name: &str,
    options: ManagerOptions,
) -> Result<WorkerManager> {
    let names: Vec<String> = match selector.into() {
        WorkerSelector::Names(names) => names,
        WorkerSelector::Count(count) => default_names(count)
            .ok_or(WorkerError::NotEnoughWorkers {
                requested: count,
                available: DEFAULT_NAMES.len(),
            })?
            .iter()
            .map(|n| n.to_string())
            .collect(),
    };
    if let Some(conditions) = &options.network {
        conditions.validate()?;
    }
    options.config.validate()?;

    let versions = options.registry.versions();
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(names.len());
    for name in &names {
        let descriptor = WorkerDescriptor::parse(name, &versions)?;
        if !seen.insert(descriptor.label()) {
            return Err(WorkerError::DuplicateWorkerName(descriptor.label()));
        }
        descriptors.push(descriptor);
    }

    let settings = WorkerSettings {
        sync_mode: options.sync_mode,
        response_mode: options.response_mode,
        pre_install_count: options.pre_install_count,
        ..WorkerSettings::from_config(&options.config.workers)
    };
    let simulator = NetworkSimulator::new();
    let mut workers = Vec::with_capacity(descriptors.len());
    for (index, descriptor) in descriptors.into_iter().enumerate() {
        let label = descriptor.label();
        let requested = descriptor
            .sdk_version
            .as_deref()
            .or(options.sdk_version.as_deref());
        let version = options
            .registry
            .resolve(requested)
            .map_err(|source| WorkerError::Provisioning {
                name: label.clone(),
                source,
            })?;
        let link = match options.config.network.seed {
            Some(seed) => NetworkLink::with_seed(label.clone(), seed.wrapping_add(index as u64)),
            None => NetworkLink::new(label.clone()),
        };
        simulator.register(link.clone());
        let keys = options.keys.get(&descriptor.base_name);
        workers.push(Arc::new(Worker::new(
            descriptor,
            keys,
            version,
            link,
            settings.clone(),
        )?));
    }

    let streams = &options.streams;
    let outcomes = join_all(workers.iter().map(|worker| async move {
        worker.initialize().await?;
        for kind in streams {
            worker.start_stream(*kind).await?;
        }
        Ok::<(), WorkerError>(())
    }))
    .await;

    if let Some(err) = outcomes.into_iter().find_map(|outcome| outcome.err()) {
        tracing::error!(test = test_name, error = %err, "worker provisioning failed");
        join_all(workers.iter().map(|worker| worker.terminate(false))).await;
        return Err(err);
    }

    if let Some(conditions) = &options.network {
        for worker in &workers {
            simulator.set_conditions(worker.name(), conditions.clone())?;
        }
    }
    let chaos = options.config.network.chaos.map(|level| {
        let interval = options
            .config
            .network
            .chaos_interval_ms
            .map(std::time::Duration::from_millis);
        simulator.start_chaos(level, interval, options.config.network.seed)
    });

    let rng = match options.config.network.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    tracing::info!(
        test = test_name,
        workers = workers.len(),
        streams = ?options.streams,
        "workers ready"
    );

    Ok(WorkerManager {
        test_name: test_name.to_string(),
        workers,
        simulator,
        config: options.config,
        rng: Mutex::new(rng),
        chaos: Mutex::new(chaos),
    })
}

/// Named, ordered collection of workers.
#[derive(Debug)]
pub struct WorkerManager {
    test_name: String,
    workers: Vec<Arc<Worker>>,
    simulator: NetworkSimulator,
    config: HarnessConfig,
    rng: Mutex<StdRng>,
    chaos: Mutex<Option<ChaosHandle>>,
}

impl WorkerManager {
    /// Test the workers were provisioned for.
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Configuration in effect.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The simulator holding every worker's link.
    pub fn simulator(&self) -> &NetworkSimulator {
        &self.simulator
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when the manager holds no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Look up a worker by label, or by base name plus installation.
    ///
    /// Without an installation, a bare base name matches installation `a`.
    pub fn get(&self, name: &str, installation: Option<&str>) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| match installation {
                Some(installation) => w.base_name() == name && w.installation() == installation,
                None => {
                    w.name() == name
                        || (w.base_name() == name && w.installation() == DEFAULT_INSTALLATION)
                }
            })
            .cloned()
    }

    /// Like [`get`](Self::get) without an installation, but missing is an error.
    pub fn must_get(&self, name: &str) -> Result<Arc<Worker>> {
        self.get(name, None)
            .ok_or_else(|| WorkerError::WorkerNotFound(name.to_string()))
    }

    /// Every worker, in provisioning order.
    pub fn get_all(&self) -> Vec<Arc<Worker>> {
        self.workers.clone()
    }

    /// Every worker except `name`.
    pub fn get_all_but(&self, name: &str) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| w.name() != name)
            .cloned()
            .collect()
    }

    /// The first worker.
    pub fn creator(&self) -> Result<Arc<Worker>> {
        self.workers
            .first()
            .cloned()
            .ok_or(WorkerError::NotEnoughWorkers {
                requested: 1,
                available: 0,
            })
    }

    /// The second worker.
    pub fn receiver(&self) -> Result<Arc<Worker>> {
        self.workers
            .get(1)
            .cloned()
            .ok_or(WorkerError::NotEnoughWorkers {
                requested: 2,
                available: self.workers.len(),
            })
    }

    /// Every worker except the creator.
    pub fn get_all_but_creator(&self) -> Vec<Arc<Worker>> {
        self.workers.iter().skip(1).cloned().collect()
    }

    /// `count` distinct workers picked at random.
    pub fn random_workers(&self, count: usize) -> Result<Vec<Arc<Worker>>> {
        if count > self.workers.len() {
            return Err(WorkerError::NotEnoughWorkers {
                requested: count,
                available: self.workers.len(),
            });
        }
        Ok(self
            .workers
            .choose_multiple(&mut *self.rng(), count)
            .cloned()
            .collect())
    }

    /// Distinct inbox ids of every worker, in provisioning order.
    pub fn inbox_ids(&self) -> Vec<InboxId> {
        let mut seen = BTreeSet::new();
        self.workers
            .iter()
            .filter(|w| seen.insert(w.inbox_id().clone()))
            .map(|w| w.inbox_id().clone())
            .collect()
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// The creator opens a group with every other worker plus `extra`
    /// members, sends a confirmation message and syncs everyone.
    pub async fn create_group_between_all(
        &self,
        name: Option<&str>,
        extra_members: &[InboxId],
    ) -> Result<Arc<dyn Conversation>> {
        let creator = self.creator()?;
        let mut members: Vec<InboxId> = self
            .inbox_ids()
            .into_iter()
            .filter(|inbox| inbox != creator.inbox_id())
            .collect();
        for inbox in extra_members {
            if !members.contains(inbox) && inbox != creator.inbox_id() {
                members.push(inbox.clone());
            }
        }

        let options = match name {
            Some(name) => GroupOptions::default().with_name(name),
            None => GroupOptions::default(),
        };
        let group = creator.client()?.new_group(&members, options).await?;
        group
            .send(&format!("{}: group ready", self.test_name))
            .await?;

        self.sync_all_workers().await;
        group.sync().await?;
        tracing::info!(
            test = %self.test_name,
            group = %group.id(),
            creator = %creator.name(),
            members = members.len() + 1,
            "group created between all workers"
        );
        Ok(group)
    }

    /// Discover conversations on every worker. Failures are logged.
    pub async fn sync_all_workers(&self) {
        join_all(self.workers.iter().map(|worker| async move {
            let outcome = match worker.client() {
                Ok(client) => client.sync().await.map_err(WorkerError::from),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                tracing::warn!(worker = %worker.name(), error = %err, "sync failed");
            }
        }))
        .await;
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// Replace `name`'s network profile.
    pub fn set_worker_network_conditions(
        &self,
        name: &str,
        conditions: NetworkConditions,
    ) -> Result<()> {
        let worker = self.must_get(name)?;
        self.simulator.set_conditions(worker.name(), conditions)
    }

    /// Reset `name`'s network profile.
    pub fn clear_worker_network_conditions(&self, name: &str) -> Result<()> {
        let worker = self.must_get(name)?;
        self.simulator.clear_conditions(worker.name())
    }

    // ========================================================================
    // Forks
    // ========================================================================

    /// Probe every worker's view of every known group for fork flags.
    ///
    /// Read only: no sync is issued, so two probes without an intervening
    /// change report the same flags.
    pub async fn check_forks(&self) -> ForkScan {
        let mut scan = ForkScan::default();
        for worker in &self.workers {
            let Ok(client) = worker.client() else {
                continue;
            };
            let conversations = match client.list().await {
                Ok(conversations) => conversations,
                Err(err) => {
                    tracing::warn!(worker = %worker.name(), error = %err, "list failed");
                    continue;
                }
            };
            for conversation in conversations {
                if conversation.kind() != ConversationKind::Group {
                    continue;
                }
                probe(worker, conversation.as_ref(), &mut scan).await;
            }
        }
        log_scan(&scan, None);
        scan
    }

    /// Probe every worker's view of one group.
    pub async fn check_forks_for_group(&self, group: &ConversationId) -> ForkScan {
        let mut scan = ForkScan::default();
        for worker in &self.workers {
            let Ok(client) = worker.client() else {
                continue;
            };
            match client.conversation_by_id(group).await {
                Ok(Some(conversation)) => probe(worker, conversation.as_ref(), &mut scan).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(worker = %worker.name(), group = %group, error = %err, "lookup failed")
                }
            }
        }
        log_scan(&scan, Some(group));
        scan
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start `kind` on every worker.
    pub async fn start_stream(&self, kind: StreamKind) -> Result<()> {
        for worker in &self.workers {
            worker.start_stream(kind).await?;
        }
        Ok(())
    }

    /// Stop chaos, every subscription and every client. With
    /// `drop_database` every local database is discarded too.
    pub async fn terminate_all(&self, drop_database: bool) -> Result<()> {
        let chaos = self
            .chaos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(chaos) = chaos {
            chaos.stop().await;
        }

        let outcomes = join_all(
            self.workers
                .iter()
                .map(|worker| worker.terminate(drop_database)),
        )
        .await;
        tracing::info!(
            test = %self.test_name,
            workers = self.workers.len(),
            drop_database,
            "all workers terminated"
        );
        outcomes.into_iter().collect()
    }

    /// Summary of every worker, also logged.
    pub fn describe(&self) -> Vec<WorkerSummary> {
        let summaries: Vec<WorkerSummary> = self.workers.iter().map(|w| w.summary()).collect();
        for summary in &summaries {
            tracing::info!(
                test = %self.test_name,
                worker = %summary.name,
                sdk = %summary.sdk_version,
                installation = ?summary.installation_id,
                conditions = %summary.conditions,
                "worker"
            );
        }
        summaries
    }
}

async fn probe(worker: &Worker, conversation: &dyn Conversation, scan: &mut ForkScan) {
    match conversation.debug_info().await {
        Ok(info) => {
            scan.checked += 1;
            if info.maybe_forked {
                scan.forked.push(ForkFlag {
                    worker: worker.name().to_string(),
                    group: conversation.id().clone(),
                    epoch: info.epoch,
                });
            }
        }
        Err(err) => tracing::warn!(
            worker = %worker.name(),
            group = %conversation.id(),
            error = %err,
            "debug_info failed"
        ),
    }
}

fn log_scan(scan: &ForkScan, group: Option<&ConversationId>) {
    if scan.has_forks() {
        tracing::warn!(group = ?group, checked = scan.checked, forked = ?scan.forked, "possible forks");
    } else {
        tracing::debug!(group = ?group, checked = scan.checked, "no forks");
    }
}
