//! The metadata manager: sole mutator of cluster topology.
//!
//! Every structural change follows one shape: take the named lock(s) in
//! the coordination store, re-read the authoritative records, write the
//! change in one atomic batch, patch the local cache, fire hooks, release.
//! Other nodes learn about the change through the watch task
//! ([`MetaManager::start_watch`]), which skips records tagged with this
//! node's id.

mod bootstrap;
mod catalog;
mod engine;
mod fragment;
mod migration;
mod reshard;
mod routing;
mod statistics;
mod watch;

pub use bootstrap::BootstrapOutcome;

use crate::cache::{MetaCache, StorageUnitChange};
use crate::hooks::{HookRegistry, StorageEngineHook, StorageUnitHook};
use crate::monitor::RequestMonitor;
use crate::probe::{BoundaryProbe, PrefixBoundary};
use parking_lot::{Mutex, RwLock};
use polystore_common::{
    Config, IdGenerator, NodeId, ReshardStatus, Result, StorageUnitId,
};
use polystore_meta_store::{
    ChangeEvent, CoordinationStore, MetaRecords, NodeMeta, StorageUnitMeta,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Cluster metadata service of one middleware node
pub struct MetaManager {
    node: NodeMeta,
    config: Config,
    records: MetaRecords,
    cache: MetaCache,
    hooks: HookRegistry,
    id_gen: IdGenerator,
    probe: Arc<dyn BoundaryProbe>,
    monitor: RequestMonitor,

    /// Largest key written through this node, plus the reshard margin
    max_active_end_key: AtomicI64,
    reshard_status: RwLock<ReshardStatus>,
    is_proposer: AtomicBool,
    /// This node counted itself in the running reshard
    reshard_acked: AtomicBool,

    applied_revision: AtomicU64,
    watch_rx: Mutex<Option<broadcast::Receiver<ChangeEvent>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
}

impl MetaManager {
    /// Register this node and load the cluster state
    ///
    /// Configured storage engines are registered when the cluster has none.
    pub fn new(config: Config, store: Arc<dyn CoordinationStore>) -> Result<Arc<Self>> {
        Self::with_probe(config, store, Arc::new(PrefixBoundary))
    }

    pub fn with_probe(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        probe: Arc<dyn BoundaryProbe>,
    ) -> Result<Arc<Self>> {
        // subscribe first; replayed events are applied idempotently
        let watch_rx = store.subscribe();
        let applied_revision = store.revision();
        let records = MetaRecords::new(store);

        let node = records.register_node(&config.node.ip, config.node.port, BTreeMap::new())?;
        info!(
            "Registered node {} at {}:{}",
            node.id, config.node.ip, config.node.port
        );

        let cache = if config.cache.enable_fragment_cache_control {
            MetaCache::with_threshold_kb(config.cache.fragment_cache_threshold_kb)
        } else {
            MetaCache::new()
        };

        let manager = Self {
            id_gen: IdGenerator::new(node.id),
            node,
            config,
            records,
            cache,
            hooks: HookRegistry::new(),
            probe,
            monitor: RequestMonitor::new(),
            max_active_end_key: AtomicI64::new(0),
            reshard_status: RwLock::new(ReshardStatus::NonResharding),
            is_proposer: AtomicBool::new(false),
            reshard_acked: AtomicBool::new(false),
            applied_revision: AtomicU64::new(applied_revision),
            watch_rx: Mutex::new(Some(watch_rx)),
            watch_task: Mutex::new(None),
            shutdown: Notify::new(),
        };

        manager.load_nodes()?;
        manager.init_storage_engines()?;
        manager.load_storage_units_and_fragments()?;
        manager.init_users()?;
        manager.load_schema_mappings()?;
        *manager.reshard_status.write() = manager.records.reshard_status()?;

        Ok(Arc::new(manager))
    }

    fn load_nodes(&self) -> Result<()> {
        for node in self.records.load_nodes()? {
            self.cache.add_node(node);
        }
        Ok(())
    }

    fn load_storage_units_and_fragments(&self) -> Result<()> {
        self.cache.init_storage_units(self.records.load_storage_units()?);
        self.cache.init_fragments(self.records.load_fragments()?);
        Ok(())
    }

    /// Run a fallible operation at the manager boundary, logging failure
    fn run<T>(&self, operation: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Failed to {}: {}", operation, e);
                None
            }
        }
    }

    fn fire_storage_unit_hooks(&self, changes: &[StorageUnitChange]) {
        for change in changes {
            self.hooks
                .notify_storage_unit(change.before.as_deref(), &change.after);
        }
    }

    // ---- Identity ----

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node.id
    }

    #[must_use]
    pub const fn node(&self) -> &NodeMeta {
        &self.node
    }

    #[must_use]
    pub fn node_list(&self) -> Vec<NodeMeta> {
        self.cache.nodes()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn id_generator(&self) -> &IdGenerator {
        &self.id_gen
    }

    #[must_use]
    pub const fn monitor(&self) -> &RequestMonitor {
        &self.monitor
    }

    // ---- Hooks ----

    pub fn register_storage_unit_hook(&self, hook: StorageUnitHook) {
        self.hooks.register_storage_unit_hook(hook);
    }

    pub fn register_storage_engine_hook(&self, hook: StorageEngineHook) {
        self.hooks.register_storage_engine_hook(hook);
    }

    // ---- Storage units ----

    #[must_use]
    pub fn storage_unit(&self, id: &StorageUnitId) -> Option<Arc<StorageUnitMeta>> {
        self.cache.storage_unit(id)
    }

    #[must_use]
    pub fn storage_units(
        &self,
        ids: &HashSet<StorageUnitId>,
    ) -> HashMap<StorageUnitId, Arc<StorageUnitMeta>> {
        self.cache.storage_units_by_ids(ids)
    }

    /// Every cached unit, sorted by id
    #[must_use]
    pub fn storage_unit_list(&self) -> Vec<Arc<StorageUnitMeta>> {
        let mut units = self.cache.storage_units();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    #[must_use]
    pub fn has_storage_unit(&self) -> bool {
        self.cache.has_storage_unit()
    }

    #[must_use]
    pub fn has_fragment(&self) -> bool {
        self.cache.has_fragment()
    }

    /// Stop the watch task and remove this node from the registry
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let task = self.watch_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("Watch task ended abnormally: {}", e);
        }
        match self.records.unregister_node(self.node.id) {
            Ok(()) => info!("Node {} unregistered", self.node.id),
            Err(e) => error!("Failed to unregister node {}: {}", self.node.id, e),
        }
    }

    /// Highest revision whose changes this node has applied
    #[must_use]
    pub fn applied_revision(&self) -> u64 {
        self.applied_revision.load(Ordering::SeqCst)
    }
}
