//! Storage engine registration and the dummy records they carry.

use super::MetaManager;
use polystore_common::config::StorageEngineConfig;
use polystore_common::{
    Error, KeyInterval, Result, StorageEngineId, StorageEngineKind, StorageUnitId,
};
use polystore_meta_store::{LockResource, StorageEngineMeta};
use polystore_placement::select_replica_set;
use std::sync::Arc;
use tracing::{debug, info};

impl MetaManager {
    /// Load engines, registering the configured ones into an empty cluster
    pub(super) fn init_storage_engines(&self) -> Result<()> {
        let mut engines = self.records.load_storage_engines()?;
        if engines.is_empty() && !self.config.storage_engines.is_empty() {
            let _engine_lock = self.records.lock(LockResource::StorageEngine, self.node.id)?;
            engines = self.records.load_storage_engines()?;
            if engines.is_empty() {
                engines = self.register_storage_engines(&self.config.storage_engines)?;
                info!("Registered {} configured storage engines", engines.len());
            }
        }
        for engine in engines {
            self.install_storage_engine(engine);
        }
        Ok(())
    }

    fn engine_meta(&self, id: StorageEngineId, config: &StorageEngineConfig) -> Result<StorageEngineMeta> {
        let mut engine = StorageEngineMeta {
            id,
            ip: config.ip.clone(),
            port: config.port,
            kind: config.kind.parse::<StorageEngineKind>()?,
            read_only: config.read_only,
            has_data: config.has_data,
            data_prefix: config.data_prefix.clone(),
            schema_prefix: config.schema_prefix.clone(),
            extra_params: config.extra_params.clone(),
            created_by: self.node.id,
            dummy_columns: None,
            dummy_keys: None,
        };
        if engine.has_data {
            let (columns, keys) = self.probe.boundary(&engine)?;
            let keys = KeyInterval::new(
                config.dummy_key_start.unwrap_or(keys.start()),
                config.dummy_key_end.unwrap_or(keys.end()),
            );
            engine.dummy_columns = Some(columns);
            engine.dummy_keys = Some(keys);
        }
        Ok(engine)
    }

    /// Allocate ids and persist engines; caller holds the engine lock
    fn register_storage_engines(&self, configs: &[StorageEngineConfig]) -> Result<Vec<StorageEngineMeta>> {
        let mut engines = Vec::with_capacity(configs.len());
        for config in configs {
            let id = self.records.next_storage_engine_id()?;
            let engine = self.engine_meta(id, config)?;
            self.records.put_storage_engine(&engine)?;
            engines.push(engine);
        }
        Ok(engines)
    }

    /// Cache an engine with its dummy unit and fragment; false if known
    pub(super) fn install_storage_engine(&self, engine: StorageEngineMeta) -> bool {
        if !self.cache.add_storage_engine(engine.clone()) {
            return false;
        }
        debug!("Storage engine {} ({}) added to cache", engine.id, engine.kind);
        self.hooks.notify_storage_engine(None, Some(&engine));
        if let Some(unit) = engine.dummy_storage_unit() {
            let changes = self.cache.apply_storage_units(vec![unit]);
            self.fire_storage_unit_hooks(&changes);
        }
        if let Some(fragment) = engine.dummy_fragment() {
            self.cache.add_dummy_fragment(fragment);
        }
        true
    }

    pub(super) fn uninstall_storage_engine(&self, id: StorageEngineId) {
        let dummy = StorageUnitId::dummy(id);
        self.cache.remove_dummy_fragment(&dummy);
        self.cache.remove_storage_unit(&dummy);
        if let Some(engine) = self.cache.remove_storage_engine(id) {
            self.hooks.notify_storage_engine(Some(&engine), None);
        }
    }

    /// Register new storage engines
    pub fn add_storage_engines(&self, configs: &[StorageEngineConfig]) -> bool {
        self.run("add storage engines", || {
            let _engine_lock = self.records.lock(LockResource::StorageEngine, self.node.id)?;
            for engine in self.register_storage_engines(configs)? {
                info!("Added storage engine {} at {}:{}", engine.id, engine.ip, engine.port);
                self.install_storage_engine(engine);
            }
            Ok(())
        })
        .is_some()
    }

    /// Remove an engine that only holds pre-existing data
    pub fn remove_dummy_storage_engine(&self, id: StorageEngineId) -> bool {
        self.run("remove dummy storage engine", || {
            let _engine_lock = self.records.lock(LockResource::StorageEngine, self.node.id)?;
            let engine = self
                .cache
                .storage_engine(id)
                .ok_or(Error::StorageEngineNotFound(id.as_u64()))?;
            if !engine.has_data {
                return Err(Error::invalid_argument(format!(
                    "storage engine {id} holds no pre-existing data"
                )));
            }
            if self.cache.storage_units_of_engine(id).iter().any(|u| !u.dummy) {
                return Err(Error::invalid_argument(format!(
                    "storage engine {id} still hosts managed storage units"
                )));
            }
            self.records.remove_storage_engine(id)?;
            self.uninstall_storage_engine(id);
            info!("Removed dummy storage engine {}", id);
            Ok(())
        })
        .is_some()
    }

    #[must_use]
    pub fn storage_engine(&self, id: StorageEngineId) -> Option<Arc<StorageEngineMeta>> {
        self.cache.storage_engine(id)
    }

    #[must_use]
    pub fn storage_engines(&self) -> Vec<Arc<StorageEngineMeta>> {
        self.cache.storage_engines()
    }

    /// Engines that accept new storage units
    #[must_use]
    pub fn writable_storage_engines(&self) -> Vec<Arc<StorageEngineMeta>> {
        self.cache
            .storage_engines()
            .into_iter()
            .filter(|e| e.is_writable())
            .collect()
    }

    #[must_use]
    pub fn has_writable_storage_engines(&self) -> bool {
        self.cache.storage_engines().iter().any(|e| e.is_writable())
    }

    /// A random set of up to `count` writable engines for a new unit
    #[must_use]
    pub fn select_replica_set(&self, count: usize) -> Vec<StorageEngineId> {
        let candidates: Vec<_> = self.writable_storage_engines().iter().map(|e| e.id).collect();
        select_replica_set(&candidates, count, &mut rand::thread_rng())
    }
}
