//! Applying changes written by other nodes.
//!
//! One task per manager consumes the store's change stream in revision
//! order. Topology records tagged `updated_by` this node were already
//! applied locally when written and are skipped.

use super::MetaManager;
use polystore_common::{
    KeyInterval, NodeId, ReshardStatus, Result, StorageEngineId, StorageUnitId,
};
use polystore_meta_store::coordination::decode_counter;
use polystore_meta_store::records::{decode_record, keys, parse_fragment_key, parse_id_key};
use polystore_meta_store::{
    ChangeEvent, ChangeKind, FragmentMeta, NodeMeta, SchemaMapping, StorageEngineMeta,
    StorageUnitMeta, Table, UserMeta,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

impl MetaManager {
    /// Start applying remote changes; a second call does nothing
    pub fn start_watch(self: &Arc<Self>) {
        let Some(mut rx) = self.watch_rx.lock().take() else {
            warn!("Watch task of node {} already started", self.node.id);
            return;
        };
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = this.shutdown.notified() => break,
                    received = rx.recv() => match received {
                        Ok(event) if event.revision <= this.applied_revision() => {
                            debug!("Skipping change at revision {}, already loaded", event.revision);
                        }
                        Ok(event) => {
                            let revision = event.revision;
                            let manager = Arc::clone(&this);
                            let applied = tokio::task::spawn_blocking(move || {
                                manager.apply_change(&event);
                            })
                            .await;
                            if let Err(e) = applied {
                                error!("Failed to apply change at revision {}: {}", revision, e);
                            }
                            this.applied_revision.fetch_max(revision, Ordering::SeqCst);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Watch of node {} missed {} changes, reloading", this.node.id, missed);
                            let manager = Arc::clone(&this);
                            let revision = this.records.store().revision();
                            let reloaded = tokio::task::spawn_blocking(move || manager.resync()).await;
                            match reloaded {
                                Ok(Ok(())) => {
                                    this.applied_revision.fetch_max(revision, Ordering::SeqCst);
                                }
                                Ok(Err(e)) => error!("Failed to reload cluster state: {}", e),
                                Err(e) => error!("Failed to reload cluster state: {}", e),
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Watch task of node {} stopped", this.node.id);
        });
        *self.watch_task.lock() = Some(task);
        info!("Node {} is watching cluster changes", self.node.id);
    }

    /// Wait until every change published so far has been applied
    pub async fn wait_for_watch(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.applied_revision() >= self.records.store().revision() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Rebuild the cache from the store after missed notifications
    ///
    /// Records deleted meanwhile are dropped from the cache, and reshard
    /// transitions this node missed are replayed.
    fn resync(&self) -> Result<()> {
        let nodes = self.records.load_nodes()?;
        let live: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
        for node in self.cache.nodes() {
            if !live.contains(&node.id) {
                debug!("Node {} left while the watch lagged", node.id);
                self.cache.remove_node(node.id);
            }
        }
        for node in nodes {
            self.cache.add_node(node);
        }

        let engines = self.records.load_storage_engines()?;
        let stored: HashSet<StorageEngineId> = engines.iter().map(|e| e.id).collect();
        for engine in self.cache.storage_engines() {
            if !stored.contains(&engine.id) {
                self.uninstall_storage_engine(engine.id);
            }
        }
        for engine in engines {
            self.install_storage_engine(engine);
        }

        self.load_storage_units_and_fragments()?;

        let users = self.records.load_users()?;
        let names: HashSet<&str> = users.iter().map(|u| u.username.as_str()).collect();
        for user in self.cache.users() {
            if !names.contains(user.username.as_str()) {
                self.cache.remove_user(&user.username);
            }
        }
        for user in users {
            self.cache.put_user(user);
        }

        let mappings = self.records.load_schema_mappings()?;
        let namespaces: HashSet<&str> = mappings.iter().map(|(ns, _)| ns.as_str()).collect();
        for namespace in self.cache.schema_namespaces() {
            if !namespaces.contains(namespace.as_str()) {
                self.cache.remove_schema_mapping(&namespace);
            }
        }
        for (namespace, mapping) in mappings {
            self.cache.put_schema_mapping(&namespace, mapping);
        }

        self.resync_reshard()
    }

    fn apply_change(&self, event: &ChangeEvent) {
        if let Err(e) = self.try_apply_change(event) {
            error!(
                "Failed to apply {:?} change '{}' at revision {}: {}",
                event.table, event.key, event.revision, e
            );
        }
    }

    fn try_apply_change(&self, event: &ChangeEvent) -> Result<()> {
        let key = event.key.as_str();
        match (event.table, &event.kind) {
            (Table::Nodes, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let node: NodeMeta = decode_record(v)?;
                debug!("Node {} joined", node.id);
                self.cache.add_node(node);
            }
            (Table::Nodes, ChangeKind::Deleted) => {
                if let Some(id) = parse_id_key(key) {
                    debug!("Node {} left", id);
                    self.cache.remove_node(NodeId::new(id));
                }
            }

            (Table::StorageEngines, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let engine: StorageEngineMeta = decode_record(v)?;
                if self.install_storage_engine(engine) {
                    debug!("Applied remote storage engine '{}'", key);
                }
            }
            (Table::StorageEngines, ChangeKind::Deleted) => {
                if let Some(id) = parse_id_key(key) {
                    self.uninstall_storage_engine(StorageEngineId::new(id));
                }
            }

            (Table::StorageUnits, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let unit: StorageUnitMeta = decode_record(v)?;
                if unit.updated_by == self.node.id {
                    return Ok(());
                }
                debug!("Applied remote storage unit {} ({:?})", unit.id, unit.state);
                let changes = self.cache.apply_storage_units(vec![unit]);
                self.fire_storage_unit_hooks(&changes);
            }
            (Table::StorageUnits, ChangeKind::Deleted) => {
                self.cache.remove_storage_unit(&StorageUnitId::from(key));
            }

            (Table::Fragments, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let fragment: FragmentMeta = decode_record(v)?;
                if fragment.updated_by == self.node.id {
                    return Ok(());
                }
                debug!("Applied remote fragment {} {}", fragment.columns, fragment.keys);
                self.cache.add_fragment(fragment);
            }
            (Table::Fragments, ChangeKind::Deleted) => {
                if let Some((columns, start_key)) = parse_fragment_key(key) {
                    let fragment = FragmentMeta::new(
                        columns,
                        KeyInterval::from_start(start_key),
                        StorageUnitId::default(),
                    );
                    self.cache.remove_fragment(&fragment);
                }
            }

            (Table::Users, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let user: UserMeta = decode_record(v)?;
                self.cache.put_user(user);
            }
            (Table::Users, ChangeKind::Deleted) => self.cache.remove_user(key),

            (Table::SchemaMappings, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let mapping: SchemaMapping = decode_record(v)?;
                self.cache.put_schema_mapping(key, mapping);
            }
            (Table::SchemaMappings, ChangeKind::Deleted) => self.cache.remove_schema_mapping(key),

            (Table::ReshardStatus, ChangeKind::Created(v) | ChangeKind::Updated(v)) => {
                let status: ReshardStatus = decode_record(v)?;
                self.on_reshard_status(status);
            }
            (Table::Counters, ChangeKind::Created(v) | ChangeKind::Updated(v))
                if key == keys::RESHARD_COUNTER =>
            {
                self.on_reshard_counter(decode_counter(v));
            }
            (Table::Statistics, ChangeKind::Created(v) | ChangeKind::Updated(v))
                if key == keys::MAX_ACTIVE_END_KEY =>
            {
                self.on_max_active_end_key(decode_counter(v));
            }
            _ => {}
        }
        Ok(())
    }
}
