//! Administrative fragment operations.

use super::MetaManager;
use polystore_common::{ColumnsRange, Error, KeyInterval, StorageEngineId, StorageUnitId};
use polystore_meta_store::{FragmentMeta, LockResource, MetaRecords, StorageUnitMeta};
use std::sync::Arc;
use tracing::info;

impl MetaManager {
    pub fn add_fragment(&self, fragment: &FragmentMeta) -> bool {
        self.run("add fragment", || {
            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            let mut fragment = fragment.clone();
            fragment.created_by = self.node.id;
            fragment.updated_by = self.node.id;
            self.records.put_fragment(&fragment)?;
            self.cache.add_fragment(fragment);
            Ok(())
        })
        .is_some()
    }

    pub fn remove_fragment(&self, fragment: &FragmentMeta) -> bool {
        self.run("remove fragment", || {
            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            self.records.remove_fragment(fragment)?;
            self.cache.remove_fragment(fragment);
            info!("Removed fragment {} {}", fragment.columns, fragment.keys);
            Ok(())
        })
        .is_some()
    }

    /// Close a fragment's columns range at `end_column`
    pub fn end_fragment_by_columns(&self, fragment: &FragmentMeta, end_column: &str) -> Option<FragmentMeta> {
        let columns = ColumnsRange::new(fragment.columns.start(), Some(end_column))
            .with_schema_prefix(fragment.columns.schema_prefix().map(str::to_string));
        let mut ended = fragment.clone();
        ended.columns = columns;
        self.update_fragment_by_columns(&fragment.columns, &ended)
            .then_some(ended)
    }

    /// Re-key a fragment whose columns range changed from `old_columns`
    pub fn update_fragment_by_columns(&self, old_columns: &ColumnsRange, fragment: &FragmentMeta) -> bool {
        self.run("update fragment by columns", || {
            let _fragment_lock = self.records.lock(LockResource::Fragment, self.node.id)?;
            let mut fragment = fragment.clone();
            fragment.updated_by = self.node.id;
            self.records.replace_fragment(old_columns, &fragment)?;
            self.cache.replace_fragment_columns(old_columns, fragment);
            Ok(())
        })
        .is_some()
    }

    /// Allocate a master unit on `engine` and rebind a copy of `fragment`
    /// to it; the fragment itself is not persisted
    pub fn generate_storage_unit_for_fragment(
        &self,
        fragment: &FragmentMeta,
        engine: StorageEngineId,
    ) -> Option<(FragmentMeta, Arc<StorageUnitMeta>)> {
        self.run("generate storage unit for fragment", || {
            let _unit_lock = self.records.lock(LockResource::StorageUnit, self.node.id)?;
            if self.cache.storage_engine(engine).is_none() {
                return Err(Error::StorageEngineNotFound(engine.as_u64()));
            }
            let id = self.records.allocate_storage_unit_id()?;
            let mut unit = StorageUnitMeta::master(id.clone(), engine, self.node.id);
            unit.initial_storage_unit = false;
            self.records
                .store()
                .apply(vec![MetaRecords::storage_unit_op(&unit)?])?;
            let changes = self.cache.apply_storage_units(vec![unit]);
            self.fire_storage_unit_hooks(&changes);

            let unit = self
                .cache
                .storage_unit(&id)
                .ok_or_else(|| Error::StorageUnitNotFound(id.to_string()))?;
            let mut rebound =
                self.new_fragment(fragment.columns.clone(), fragment.keys, id, false);
            rebound.master_storage_unit = Some(Arc::clone(&unit));
            Ok((rebound, unit))
        })
    }

    /// Fragments bound to a unit, dummy ones included
    #[must_use]
    pub fn fragments_by_storage_unit(&self, id: &StorageUnitId) -> Vec<FragmentMeta> {
        self.cache.fragments_by_storage_unit(id)
    }

    /// Smallest rectangle covering every fragment bound to a unit
    #[must_use]
    pub fn boundary_of_storage_unit(&self, id: &StorageUnitId) -> Option<(ColumnsRange, KeyInterval)> {
        let fragments = self.cache.fragments_by_storage_unit(id);
        let (first, rest) = fragments.split_first()?;
        let mut start = first.columns.start().map(str::to_string);
        let mut end = first.columns.end().map(str::to_string);
        let (mut start_key, mut end_key) = (first.keys.start(), first.keys.end());
        for fragment in rest {
            start = match (start, fragment.columns.start()) {
                (Some(a), Some(b)) => Some(if b < a.as_str() { b.to_string() } else { a }),
                _ => None,
            };
            end = match (end, fragment.columns.end()) {
                (Some(a), Some(b)) => Some(if b > a.as_str() { b.to_string() } else { a }),
                _ => None,
            };
            start_key = start_key.min(fragment.keys.start());
            end_key = end_key.max(fragment.keys.end());
        }
        Some((ColumnsRange::new(start, end), KeyInterval::new(start_key, end_key)))
    }
}
