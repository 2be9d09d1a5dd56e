//! Creating storage units and fragment generations.
//!
//! Proposals arrive with fake unit ids. Real ids are allocated under the
//! storage-unit lock and the fake-to-real map lives only for the duration
//! of one call.

use super::MetaManager;
use crate::cache::link_replicas;
use crate::validate::{check_generation_tiling, check_initial_tiling};
use polystore_common::{
    ColumnsRange, Error, KeyInterval, Result, StorageEngineId, StorageUnitId,
};
use polystore_meta_store::{
    FragmentMeta, LockResource, MetaRecords, MetaStoreResult, StorageUnitMeta, WriteOp,
};
use polystore_placement::{FragmentPlan, LayoutPlan, StorageUnitPlan};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Result of a bootstrap attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This node created the initial layout
    InitializedByMe,
    /// Another node had already created it; this node loaded it
    AlreadyInitialized,
    /// Validation or the coordination store failed; nothing was written
    Failed,
}

/// Proposed fragments with fake unit ids, for validation only
fn proposed_fragments(plans: &[FragmentPlan]) -> Vec<FragmentMeta> {
    plans
        .iter()
        .map(|p| FragmentMeta::new(p.columns.clone(), p.keys, StorageUnitId::new(&p.storage_unit)))
        .collect()
}

fn unit_ops(units: &[StorageUnitMeta]) -> MetaStoreResult<Vec<WriteOp>> {
    units.iter().map(MetaRecords::storage_unit_op).collect()
}

impl MetaManager {
    pub(super) fn require_engine(&self, id: StorageEngineId) -> Result<()> {
        match self.cache.storage_engine(id) {
            Some(_) => Ok(()),
            None => Err(Error::StorageEngineNotFound(id.as_u64())),
        }
    }

    /// A fragment tagged as created by this node
    pub(super) fn new_fragment(
        &self,
        columns: ColumnsRange,
        keys: KeyInterval,
        unit: StorageUnitId,
        initial: bool,
    ) -> FragmentMeta {
        let mut fragment = FragmentMeta::new(columns, keys, unit);
        fragment.created_by = self.node.id;
        fragment.updated_by = self.node.id;
        fragment.initial_fragment = initial;
        fragment
    }

    /// Allocate real units for a proposal; caller holds the unit lock
    ///
    /// Returns each master followed by its replicas.
    fn realize_storage_units(
        &self,
        plans: &[StorageUnitPlan],
        initial: bool,
    ) -> Result<(HashMap<String, StorageUnitId>, Vec<StorageUnitMeta>)> {
        let mut fake_to_real = HashMap::new();
        let mut units = Vec::new();
        for plan in plans {
            self.require_engine(plan.storage_engine_id)?;
            let id = self.records.allocate_storage_unit_id()?;
            let mut master = StorageUnitMeta::master(id.clone(), plan.storage_engine_id, self.node.id);
            master.initial_storage_unit = initial;
            fake_to_real.insert(plan.fake_id.clone(), id.clone());

            let mut replicas = Vec::with_capacity(plan.replicas.len());
            for replica in &plan.replicas {
                self.require_engine(replica.storage_engine_id)?;
                let replica_id = self.records.allocate_storage_unit_id()?;
                let mut unit = StorageUnitMeta::replica(
                    replica_id.clone(),
                    replica.storage_engine_id,
                    id.clone(),
                    self.node.id,
                );
                unit.initial_storage_unit = initial;
                fake_to_real.insert(replica.fake_id.clone(), replica_id);
                replicas.push(unit);
            }
            master.replicas = replicas.iter().map(|r| r.id.clone()).collect();
            units.push(master);
            units.extend(replicas);
        }
        Ok((fake_to_real, units))
    }

    fn realize_fragments(
        &self,
        plans: &[FragmentPlan],
        fake_to_real: &HashMap<String, StorageUnitId>,
        initial: bool,
    ) -> Result<Vec<FragmentMeta>> {
        plans
            .iter()
            .map(|plan| {
                let unit = fake_to_real.get(&plan.storage_unit).ok_or_else(|| {
                    Error::invalid_layout(format!(
                        "fragment {} is bound to unknown unit {}",
                        plan.columns, plan.storage_unit
                    ))
                })?;
                Ok(self.new_fragment(plan.columns.clone(), plan.keys, unit.clone(), initial))
            })
            .collect()
    }

    /// Create the cluster's initial layout, at most once cluster-wide
    ///
    /// Every caller takes the fragment lock then the storage-unit lock and
    /// re-checks the store. The first one persists the proposal; later
    /// ones load what it wrote.
    pub fn create_initial_fragments_and_storage_units(&self, plan: &LayoutPlan) -> BootstrapOutcome {
        if let Err(e) = check_initial_tiling(&proposed_fragments(&plan.fragments)) {
            error!("Rejected initial layout: {}", e);
            return BootstrapOutcome::Failed;
        }
        self.run("create initial fragments and storage units", || {
            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;

            let stored = self.records.load_storage_units()?;
            if !stored.is_empty() {
                warn!("Storage units already created by another node, loading them");
                for unit in link_replicas(stored.clone()) {
                    self.hooks.notify_storage_unit(None, &unit);
                }
                self.cache.init_storage_units(stored);
                self.cache.init_fragments(self.records.load_fragments()?);
                return Ok(BootstrapOutcome::AlreadyInitialized);
            }

            let (fake_to_real, units) = self.realize_storage_units(&plan.storage_units, true)?;
            let fragments = self.realize_fragments(&plan.fragments, &fake_to_real, true)?;
            let mut ops = unit_ops(&units)?;
            for fragment in &fragments {
                ops.push(MetaRecords::fragment_op(fragment)?);
            }
            self.records.store().apply(ops)?;

            for unit in &units {
                self.hooks.notify_storage_unit(None, unit);
            }
            self.cache.apply_storage_units(units);
            self.cache.add_fragments(fragments);
            info!(
                "Node {} created the initial layout: {} storage units, {} fragments",
                self.node.id,
                fake_to_real.len(),
                plan.fragments.len()
            );
            Ok(BootstrapOutcome::InitializedByMe)
        })
        .unwrap_or(BootstrapOutcome::Failed)
    }

    /// Add a new fragment generation, closing the latest fragments it covers
    pub fn create_fragments_and_storage_units(&self, plan: &LayoutPlan) -> bool {
        let start_key = match check_generation_tiling(&proposed_fragments(&plan.fragments)) {
            Ok(key) => key,
            Err(e) => {
                error!("Rejected fragment generation: {}", e);
                return false;
            }
        };
        self.run("create fragments and storage units", || {
            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;

            let superseded: Vec<FragmentMeta> = self
                .records
                .load_fragments()?
                .into_iter()
                .filter(|f| {
                    f.is_latest() && plan.fragments.iter().any(|p| p.columns.intersects(&f.columns))
                })
                .collect();
            if let Some(f) = superseded.iter().find(|f| f.keys.start() >= start_key) {
                return Err(Error::invalid_layout(format!(
                    "generation at key {start_key} does not follow fragment {} starting at {}",
                    f.columns,
                    f.keys.start()
                )));
            }

            let (fake_to_real, units) = self.realize_storage_units(&plan.storage_units, false)?;
            let fragments = self.realize_fragments(&plan.fragments, &fake_to_real, false)?;
            let ended: Vec<FragmentMeta> = superseded
                .iter()
                .map(|f| {
                    let mut ended = f.end_at(start_key);
                    ended.updated_by = self.node.id;
                    ended
                })
                .collect();

            let mut ops = unit_ops(&units)?;
            for fragment in ended.iter().chain(&fragments) {
                ops.push(MetaRecords::fragment_op(fragment)?);
            }
            self.records.store().apply(ops)?;

            let changes = self.cache.apply_storage_units(units);
            self.fire_storage_unit_hooks(&changes);
            info!(
                "Created {} fragments at key {}, closed {}",
                fragments.len(),
                start_key,
                ended.len()
            );
            self.cache.add_fragments(ended.into_iter().chain(fragments).collect());
            Ok(())
        })
        .is_some()
    }

    /// Close `fragment` at the new fragment's start key and bind the new
    /// fragment to a freshly created unit
    ///
    /// Returns the closed fragment.
    pub fn split_fragment_and_storage_unit(
        &self,
        unit: &StorageUnitPlan,
        new_fragment: &FragmentPlan,
        fragment: &FragmentMeta,
    ) -> Option<FragmentMeta> {
        self.run("split fragment and storage unit", || {
            let split_key = new_fragment.keys.start();
            if split_key <= fragment.keys.start() || !fragment.keys.contains(split_key) {
                return Err(Error::invalid_layout(format!(
                    "split key {split_key} is outside fragment keys {}",
                    fragment.keys
                )));
            }
            if !new_fragment.columns.intersects(&fragment.columns) {
                return Err(Error::invalid_layout(format!(
                    "new columns {} do not overlap {}",
                    new_fragment.columns, fragment.columns
                )));
            }

            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;

            let current = self
                .records
                .fragment(&fragment.columns, fragment.keys.start())?
                .ok_or_else(|| {
                    Error::FragmentNotFound(format!("{} {}", fragment.columns, fragment.keys))
                })?;
            if !current.keys.contains(split_key) {
                return Err(Error::invalid_layout(format!(
                    "fragment {} now covers {}, cannot split at {split_key}",
                    current.columns, current.keys
                )));
            }

            let (fake_to_real, units) =
                self.realize_storage_units(std::slice::from_ref(unit), false)?;
            let added = self.realize_fragments(
                std::slice::from_ref(new_fragment),
                &fake_to_real,
                false,
            )?;
            let mut ended = current.end_at(split_key);
            ended.updated_by = self.node.id;

            let mut ops = unit_ops(&units)?;
            ops.push(MetaRecords::fragment_op(&ended)?);
            for fragment in &added {
                ops.push(MetaRecords::fragment_op(fragment)?);
            }
            self.records.store().apply(ops)?;

            let changes = self.cache.apply_storage_units(units);
            self.fire_storage_unit_hooks(&changes);
            let mut cached = added;
            cached.push(ended.clone());
            self.cache.add_fragments(cached);
            info!(
                "Split fragment {} at key {} onto {}",
                ended.columns, split_key, new_fragment.columns
            );
            Ok(ended)
        })
    }
}
