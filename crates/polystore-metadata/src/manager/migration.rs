//! Moving storage units between storage engines.
//!
//! A unit's own record says how far a migration got: `migration_to` set
//! on a NORMAL source means a copy is in flight, a DISCARD source whose
//! target is CREATING means the catch-up copy has not finished. Retried
//! calls read that state and resume instead of allocating again.

use super::MetaManager;
use crate::cache::link_replicas;
use polystore_common::{Error, Result, StorageEngineId, StorageUnitId, StorageUnitState};
use polystore_meta_store::{
    LockResource, MetaRecords, MetaStoreResult, MigrationPlan, StorageUnitMeta,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

type UnitMap = HashMap<StorageUnitId, StorageUnitMeta>;

impl MetaManager {
    /// Stored units with replica lists; caller holds the unit lock
    fn load_linked_units(&self) -> Result<UnitMap> {
        Ok(link_replicas(self.records.load_storage_units()?)
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect())
    }

    fn migration_target(
        &self,
        source: &StorageUnitMeta,
        id: StorageUnitId,
        engine: StorageEngineId,
    ) -> StorageUnitMeta {
        let mut target = if source.is_master {
            StorageUnitMeta::master(id, engine, self.node.id)
        } else {
            StorageUnitMeta::replica(id, engine, source.master_id.clone(), self.node.id)
        };
        target.initial_storage_unit = false;
        target.state = StorageUnitState::Creating;
        target
    }

    /// Where the catch-up copy for a migration without data reads from:
    /// the last surviving replica of a discarded master, or the master of
    /// a discarded replica
    fn data_source(source: &StorageUnitMeta, target: &StorageUnitMeta) -> Option<StorageUnitId> {
        if source.is_master {
            target.replicas.last().cloned()
        } else {
            Some(source.master_id.clone())
        }
    }

    fn persist_units(&self, writes: Vec<StorageUnitMeta>) -> Result<()> {
        let ops = writes
            .iter()
            .map(MetaRecords::storage_unit_op)
            .collect::<MetaStoreResult<Vec<_>>>()?;
        self.records.store().apply(ops)?;
        let changes = self.cache.apply_storage_units(writes);
        self.fire_storage_unit_hooks(&changes);
        Ok(())
    }

    /// Start moving units to other engines
    ///
    /// With data, returns `source -> target` and the caller copies data
    /// before [`Self::finish_migration`]. Without data the source engine is
    /// gone: sources are discarded at once and the result maps each data
    /// source unit to the target it must be copied into.
    pub fn start_migration(
        &self,
        plan: &BTreeMap<StorageUnitId, StorageEngineId>,
        with_data: bool,
    ) -> Option<HashMap<StorageUnitId, StorageUnitId>> {
        self.run("start migration", || {
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;
            let mut units = self.load_linked_units()?;
            let mut result = HashMap::new();
            let mut writes = Vec::new();

            for (source_id, engine) in plan {
                self.require_engine(*engine)?;
                let source = units
                    .get(source_id)
                    .cloned()
                    .ok_or_else(|| Error::StorageUnitNotFound(source_id.to_string()))?;

                if source.state == StorageUnitState::Discard {
                    let target = source.migration_to.as_ref().and_then(|t| units.get(t));
                    match target {
                        Some(target) if !with_data && target.state == StorageUnitState::Creating => {
                            if let Some(data_source) = Self::data_source(&source, target) {
                                result.insert(data_source, target.id.clone());
                            }
                        }
                        _ => info!("Storage unit {} is already migrated", source_id),
                    }
                    continue;
                }
                if with_data && let Some(target) = &source.migration_to {
                    result.insert(source_id.clone(), target.clone());
                    continue;
                }

                let target_id = self.records.allocate_storage_unit_id()?;
                let mut target = self.migration_target(&source, target_id.clone(), *engine);
                let mut updated = source.clone();
                updated.migration_to = Some(target_id.clone());
                updated.updated_by = self.node.id;

                if with_data {
                    result.insert(source_id.clone(), target_id.clone());
                    writes.push(target.clone());
                } else {
                    updated.state = StorageUnitState::Discard;
                    writes.push(target.clone());
                    if source.is_master {
                        for replica_id in &source.replicas {
                            if let Some(replica) = units.get_mut(replica_id) {
                                replica.master_id = target_id.clone();
                                replica.updated_by = self.node.id;
                                writes.push(replica.clone());
                            }
                        }
                        target.replicas = source.replicas.clone();
                    }
                    match Self::data_source(&source, &target) {
                        Some(data_source) => {
                            result.insert(data_source, target_id.clone());
                        }
                        None => warn!(
                            "Storage unit {} has no surviving replica to copy from",
                            source_id
                        ),
                    }
                }
                info!(
                    "Migrating storage unit {} to {} on engine {} ({} data)",
                    source_id,
                    target_id,
                    engine,
                    if with_data { "with" } else { "without" }
                );
                writes.push(updated.clone());
                units.insert(target_id, target);
                units.insert(source_id.clone(), updated);
            }

            if !writes.is_empty() {
                self.persist_units(writes)?;
            }
            Ok(result)
        })
    }

    /// Discard the source and activate its target; true if the migration
    /// is complete after the call
    pub fn finish_migration(&self, source_id: &StorageUnitId, with_data: bool) -> bool {
        self.run("finish migration", || {
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;
            let units = self.load_linked_units()?;
            let source = units
                .get(source_id)
                .ok_or_else(|| Error::StorageUnitNotFound(source_id.to_string()))?;
            let target_id = source.migration_to.clone().ok_or_else(|| {
                Error::invalid_argument(format!("storage unit {source_id} is not migrating"))
            })?;
            let target = units
                .get(&target_id)
                .ok_or_else(|| Error::StorageUnitNotFound(target_id.to_string()))?;
            if !with_data && source.state != StorageUnitState::Discard {
                return Err(Error::invalid_argument(format!(
                    "storage unit {source_id} was not migrated without data"
                )));
            }
            if source.state == StorageUnitState::Discard && target.state == StorageUnitState::Normal {
                return Ok(());
            }

            let mut writes = Vec::new();
            let mut activated = target.clone();
            activated.state = StorageUnitState::Normal;
            activated.updated_by = self.node.id;
            writes.push(activated);
            if source.is_master {
                for replica_id in &source.replicas {
                    if let Some(replica) = units.get(replica_id) {
                        let mut replica = replica.clone();
                        replica.master_id = target_id.clone();
                        replica.updated_by = self.node.id;
                        writes.push(replica);
                    }
                }
            }
            let mut discarded = source.clone();
            discarded.state = StorageUnitState::Discard;
            discarded.updated_by = self.node.id;
            writes.push(discarded);

            self.persist_units(writes)?;
            info!("Finished migrating storage unit {} to {}", source_id, target_id);
            Ok(())
        })
        .is_some()
    }

    // ---- Migration plans ----

    /// Persist the recovery plan of a failed engine
    pub fn store_migration_plan(&self, plan: &MigrationPlan) -> bool {
        self.run("store migration plan", || {
            let _plan_lock = self.records.lock(LockResource::MigrationPlan, self.node.id)?;
            self.records.put_migration_plan(plan)?;
            Ok(())
        })
        .is_some()
    }

    #[must_use]
    pub fn migration_plan(&self, engine: StorageEngineId) -> Option<MigrationPlan> {
        self.run("load migration plan", || Ok(self.records.migration_plan(engine)?))
            .flatten()
    }

    pub fn delete_migration_plan(&self, engine: StorageEngineId) -> bool {
        self.run("delete migration plan", || {
            let _plan_lock = self.records.lock(LockResource::MigrationPlan, self.node.id)?;
            self.records.remove_migration_plan(engine)?;
            Ok(())
        })
        .is_some()
    }
}
