//! In-process index over the cluster metadata.
//!
//! Fragments and storage units are held as immutable snapshots behind
//! `ArcSwap`: readers load the current snapshot without locking, writers
//! build the next snapshot under a writer mutex and swap it in. The small
//! catalogs (engines, nodes, users, schema mappings) use plain `RwLock`s.
//!
//! When retention is enabled the cache keeps a bounded number of fragments.
//! Overflow evicts the oldest key generation and raises `min_key`; anything
//! starting before `min_key` must be fetched from the coordination store.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use polystore_common::{
    ColumnsRange, KeyInterval, NodeId, StorageEngineId, StorageUnitId, StorageUnitState,
};
use polystore_meta_store::{
    FRAGMENT_META_SIZE, FragmentMeta, NodeMeta, SchemaMapping, StorageEngineMeta, StorageUnitMeta,
    UserMeta,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Fragments grouped by columns range, each list ordered by start key
#[derive(Clone, Debug, Default)]
struct FragmentIndex {
    by_columns: BTreeMap<ColumnsRange, Vec<FragmentMeta>>,
    dummy: Vec<FragmentMeta>,
    size: usize,
    min_key: i64,
}

impl FragmentIndex {
    /// Insert, or replace the fragment of the same columns range and start key
    fn upsert(&mut self, fragment: FragmentMeta) -> bool {
        let list = self.by_columns.entry(fragment.columns.clone()).or_default();
        let start = fragment.keys.start();
        match list.binary_search_by_key(&start, |f| f.keys.start()) {
            Ok(pos) => {
                list[pos] = fragment;
                false
            }
            Err(pos) => {
                list.insert(pos, fragment);
                self.size += 1;
                true
            }
        }
    }

    fn remove(&mut self, columns: &ColumnsRange, start_key: i64) -> Option<FragmentMeta> {
        let list = self.by_columns.get_mut(columns)?;
        let pos = list.iter().position(|f| f.keys.start() == start_key)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.by_columns.remove(columns);
        }
        self.size -= 1;
        Some(removed)
    }

    /// Drop the oldest generation; false when nothing can be evicted
    fn evict_oldest_generation(&mut self) -> bool {
        let Some(oldest) = self
            .by_columns
            .values()
            .filter_map(|list| list.first())
            .filter(|f| !f.is_latest())
            .map(|f| f.keys.start())
            .min()
        else {
            return false;
        };

        let mut next_min = self.min_key;
        let mut evicted = 0;
        for list in self.by_columns.values_mut() {
            if list.first().is_some_and(|f| f.keys.start() == oldest && !f.is_latest()) {
                let fragment = list.remove(0);
                next_min = next_min.max(fragment.keys.end());
                evicted += 1;
            }
        }
        self.by_columns.retain(|_, list| !list.is_empty());
        self.size -= evicted;
        self.min_key = next_min;
        debug!(
            "Evicted {} fragments starting at {}, min key now {}",
            evicted, oldest, self.min_key
        );
        true
    }
}

/// One touched unit of [`MetaCache::apply_storage_units`]
#[derive(Clone, Debug)]
pub struct StorageUnitChange {
    pub before: Option<Arc<StorageUnitMeta>>,
    pub after: Arc<StorageUnitMeta>,
}

/// Read-optimized projection of the coordination store
pub struct MetaCache {
    fragments: ArcSwap<FragmentIndex>,
    fragment_writer: Mutex<()>,
    storage_units: ArcSwap<HashMap<StorageUnitId, Arc<StorageUnitMeta>>>,
    storage_unit_writer: Mutex<()>,
    storage_engines: RwLock<BTreeMap<StorageEngineId, Arc<StorageEngineMeta>>>,
    nodes: RwLock<BTreeMap<NodeId, NodeMeta>>,
    users: RwLock<HashMap<String, UserMeta>>,
    schema_mappings: RwLock<HashMap<String, SchemaMapping>>,
    /// Max cached fragments when retention is enabled
    max_fragments: Option<usize>,
}

impl MetaCache {
    /// A cache without retention
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(None)
    }

    /// A cache keeping at most `threshold_kb` worth of fragments
    #[must_use]
    pub fn with_threshold_kb(threshold_kb: usize) -> Self {
        Self::with_retention(Some((threshold_kb * 1024 / FRAGMENT_META_SIZE).max(1)))
    }

    fn with_retention(max_fragments: Option<usize>) -> Self {
        Self {
            fragments: ArcSwap::from_pointee(FragmentIndex::default()),
            fragment_writer: Mutex::new(()),
            storage_units: ArcSwap::from_pointee(HashMap::new()),
            storage_unit_writer: Mutex::new(()),
            storage_engines: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            users: RwLock::new(HashMap::new()),
            schema_mappings: RwLock::new(HashMap::new()),
            max_fragments,
        }
    }

    #[must_use]
    pub const fn retention_enabled(&self) -> bool {
        self.max_fragments.is_some()
    }

    fn update_fragments<R>(&self, f: impl FnOnce(&mut FragmentIndex) -> R) -> R {
        let _writer = self.fragment_writer.lock();
        let mut next = FragmentIndex::clone(&self.fragments.load());
        let result = f(&mut next);
        if let Some(max) = self.max_fragments {
            while next.size > max {
                if !next.evict_oldest_generation() {
                    error!(
                        "Fragment cache holds {} fragments over a limit of {} and none can be evicted",
                        next.size, max
                    );
                    break;
                }
            }
        }
        self.fragments.store(Arc::new(next));
        result
    }

    fn update_storage_units<R>(
        &self,
        f: impl FnOnce(&mut HashMap<StorageUnitId, Arc<StorageUnitMeta>>) -> R,
    ) -> R {
        let _writer = self.storage_unit_writer.lock();
        let mut next = HashMap::clone(&self.storage_units.load());
        let result = f(&mut next);
        self.storage_units.store(Arc::new(next));
        result
    }

    // ---- Fragments ----

    /// Replace every non-dummy fragment
    pub fn init_fragments(&self, fragments: Vec<FragmentMeta>) {
        let count = fragments.len();
        self.update_fragments(|index| {
            index.by_columns.clear();
            index.size = 0;
            index.min_key = 0;
            for fragment in fragments {
                index.upsert(fragment);
            }
        });
        info!("Loaded {} fragments into cache", count);
    }

    /// Insert a fragment, or replace the one with the same columns range and
    /// start key
    pub fn add_fragment(&self, fragment: FragmentMeta) {
        self.update_fragments(|index| {
            index.upsert(fragment);
        });
    }

    pub fn add_fragments(&self, fragments: Vec<FragmentMeta>) {
        self.update_fragments(|index| {
            for fragment in fragments {
                index.upsert(fragment);
            }
        });
    }

    /// Remove the fragment with this columns range and start key
    pub fn remove_fragment(&self, fragment: &FragmentMeta) -> bool {
        self.update_fragments(|index| {
            index
                .remove(&fragment.columns, fragment.keys.start())
                .is_some()
        })
    }

    /// Move the latest fragment of `old_columns` to `fragment.columns`
    pub fn replace_fragment_columns(&self, old_columns: &ColumnsRange, fragment: FragmentMeta) {
        self.update_fragments(|index| {
            index.remove(old_columns, fragment.keys.start());
            index.upsert(fragment);
        });
    }

    pub fn add_dummy_fragment(&self, fragment: FragmentMeta) {
        self.update_fragments(|index| {
            index.dummy.retain(|f| f.master_storage_unit_id != fragment.master_storage_unit_id);
            index.dummy.push(fragment);
        });
    }

    pub fn remove_dummy_fragment(&self, unit: &StorageUnitId) {
        self.update_fragments(|index| index.dummy.retain(|f| &f.master_storage_unit_id != unit));
    }

    /// Whether any fragment is known, counting evicted history
    #[must_use]
    pub fn has_fragment(&self) -> bool {
        let index = self.fragments.load();
        !index.by_columns.is_empty() || (self.retention_enabled() && index.min_key != 0)
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.load().size
    }

    /// Smallest key still fully covered by the cache
    #[must_use]
    pub fn min_key(&self) -> i64 {
        self.fragments.load().min_key
    }

    #[must_use]
    pub fn fragments(&self) -> Vec<FragmentMeta> {
        self.fragments
            .load()
            .by_columns
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Fragment lists of every columns range intersecting `columns`
    #[must_use]
    pub fn fragments_by_columns(
        &self,
        columns: &ColumnsRange,
    ) -> BTreeMap<ColumnsRange, Vec<FragmentMeta>> {
        let index = self.fragments.load();
        let mut result = BTreeMap::new();
        for (range, list) in &index.by_columns {
            if range.is_completely_after(columns) {
                break;
            }
            if range.intersects(columns) {
                result.insert(range.clone(), list.clone());
            }
        }
        result
    }

    /// Like [`Self::fragments_by_columns`], keeping only fragments whose key
    /// interval intersects `keys`
    #[must_use]
    pub fn fragments_by_columns_and_keys(
        &self,
        columns: &ColumnsRange,
        keys: &KeyInterval,
    ) -> BTreeMap<ColumnsRange, Vec<FragmentMeta>> {
        let index = self.fragments.load();
        let mut result = BTreeMap::new();
        for (range, list) in &index.by_columns {
            if range.is_completely_after(columns) {
                break;
            }
            if range.intersects(columns) {
                let hits = search_keys(list, keys);
                if !hits.is_empty() {
                    result.insert(range.clone(), hits);
                }
            }
        }
        result
    }

    /// Fragments of the exact columns range
    #[must_use]
    pub fn fragments_by_exact_columns(&self, columns: &ColumnsRange) -> Vec<FragmentMeta> {
        self.fragments
            .load()
            .by_columns
            .get(columns)
            .cloned()
            .unwrap_or_default()
    }

    /// Every fragment whose columns range contains `column`
    #[must_use]
    pub fn fragments_by_column(&self, column: &str) -> Vec<FragmentMeta> {
        let index = self.fragments.load();
        let mut result = Vec::new();
        for (range, list) in &index.by_columns {
            if range.is_after(column) {
                break;
            }
            if range.contains(column) {
                result.extend(list.iter().cloned());
            }
        }
        result
    }

    #[must_use]
    pub fn fragments_by_column_and_keys(&self, column: &str, keys: &KeyInterval) -> Vec<FragmentMeta> {
        let index = self.fragments.load();
        let mut result = Vec::new();
        for (range, list) in &index.by_columns {
            if range.is_after(column) {
                break;
            }
            if range.contains(column) {
                result.extend(search_keys(list, keys));
            }
        }
        result
    }

    /// The open-ended fragment of each columns range intersecting `columns`
    #[must_use]
    pub fn latest_fragments_by_columns(
        &self,
        columns: &ColumnsRange,
    ) -> BTreeMap<ColumnsRange, FragmentMeta> {
        let index = self.fragments.load();
        let mut result = BTreeMap::new();
        for (range, list) in &index.by_columns {
            if range.is_completely_after(columns) {
                break;
            }
            if range.intersects(columns)
                && let Some(last) = list.last().filter(|f| f.is_latest())
            {
                result.insert(range.clone(), last.clone());
            }
        }
        result
    }

    /// The open-ended fragment of every columns range
    #[must_use]
    pub fn latest_fragments(&self) -> BTreeMap<ColumnsRange, FragmentMeta> {
        self.fragments
            .load()
            .by_columns
            .iter()
            .filter_map(|(range, list)| {
                list.last()
                    .filter(|f| f.is_latest())
                    .map(|f| (range.clone(), f.clone()))
            })
            .collect()
    }

    #[must_use]
    pub fn latest_fragment_by_column(&self, column: &str) -> Option<FragmentMeta> {
        let index = self.fragments.load();
        for (range, list) in &index.by_columns {
            if range.is_after(column) {
                break;
            }
            if range.contains(column)
                && let Some(last) = list.last().filter(|f| f.is_latest())
            {
                return Some(last.clone());
            }
        }
        None
    }

    #[must_use]
    pub fn dummy_fragments_by_columns(&self, columns: &ColumnsRange) -> Vec<FragmentMeta> {
        self.fragments
            .load()
            .dummy
            .iter()
            .filter(|f| f.columns.intersects(columns))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn dummy_fragments_by_columns_and_keys(
        &self,
        columns: &ColumnsRange,
        keys: &KeyInterval,
    ) -> Vec<FragmentMeta> {
        self.fragments
            .load()
            .dummy
            .iter()
            .filter(|f| f.columns.intersects(columns) && f.keys.intersects(keys))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn dummy_fragments(&self) -> Vec<FragmentMeta> {
        self.fragments.load().dummy.clone()
    }

    /// Fragments bound to `unit`, dummy ones included
    #[must_use]
    pub fn fragments_by_storage_unit(&self, unit: &StorageUnitId) -> Vec<FragmentMeta> {
        let index = self.fragments.load();
        index
            .by_columns
            .values()
            .flatten()
            .chain(index.dummy.iter())
            .filter(|f| &f.master_storage_unit_id == unit)
            .cloned()
            .collect()
    }

    // ---- Storage units ----

    /// Replace every managed storage unit, rebuilding replica lists
    pub fn init_storage_units(&self, units: Vec<StorageUnitMeta>) {
        let count = units.len();
        let units = link_replicas(units);
        self.update_storage_units(|map| {
            map.retain(|_, u| u.dummy);
            for unit in units {
                map.insert(unit.id.clone(), Arc::new(unit));
            }
        });
        info!("Loaded {} storage units into cache", count);
    }

    /// Apply unit records in order, keeping master replica lists in step
    ///
    /// A master lists every non-discarded replica whose `master_id` points
    /// at it. Records equal to the cached snapshot are ignored. Returns one
    /// change per touched unit, masters included, with the snapshot from
    /// before the batch and the final one.
    pub fn apply_storage_units(&self, units: Vec<StorageUnitMeta>) -> Vec<StorageUnitChange> {
        self.update_storage_units(|map| {
            let mut touched: Vec<(StorageUnitId, Option<Arc<StorageUnitMeta>>)> = Vec::new();
            let mut touch = |map: &HashMap<StorageUnitId, Arc<StorageUnitMeta>>,
                             id: &StorageUnitId| {
                if !touched.iter().any(|(t, _)| t == id) {
                    touched.push((id.clone(), map.get(id).cloned()));
                }
            };

            for mut unit in units {
                let before = map.get(&unit.id).cloned();
                if before.as_ref().is_some_and(|b| b.same_record(&unit)) {
                    continue;
                }
                touch(map, &unit.id);

                unit.replicas = if unit.state == StorageUnitState::Discard || !unit.is_master {
                    Vec::new()
                } else if let Some(before) = before.as_ref().filter(|b| b.is_master) {
                    before.replicas.clone()
                } else {
                    let mut replicas: Vec<_> = map
                        .values()
                        .filter(|u| {
                            !u.is_master
                                && u.master_id == unit.id
                                && u.state != StorageUnitState::Discard
                        })
                        .map(|u| u.id.clone())
                        .collect();
                    replicas.sort();
                    replicas
                };

                if let Some(before) = before.as_ref().filter(|b| !b.is_master) {
                    if before.master_id != unit.master_id
                        && let Some(old_master) = map.get(&before.master_id).cloned()
                    {
                        touch(map, &old_master.id);
                        map.insert(
                            old_master.id.clone(),
                            Arc::new(old_master.without_replica(&unit.id)),
                        );
                    }
                }

                if !unit.is_master {
                    match map.get(&unit.master_id).cloned() {
                        Some(master) => {
                            touch(map, &master.id);
                            let next = if unit.state == StorageUnitState::Discard {
                                master.without_replica(&unit.id)
                            } else {
                                master.with_replica(&unit.id)
                            };
                            map.insert(master.id.clone(), Arc::new(next));
                        }
                        None => error!(
                            "Storage unit {} references unknown master {}",
                            unit.id, unit.master_id
                        ),
                    }
                }

                map.insert(unit.id.clone(), Arc::new(unit));
            }

            touched
                .into_iter()
                .filter_map(|(id, before)| {
                    map.get(&id).map(|after| StorageUnitChange {
                        before,
                        after: Arc::clone(after),
                    })
                })
                .collect()
        })
    }

    /// Drop a unit and unlink it from its master
    pub fn remove_storage_unit(&self, id: &StorageUnitId) -> Option<Arc<StorageUnitMeta>> {
        self.update_storage_units(|map| {
            let removed = map.remove(id)?;
            if !removed.is_master
                && let Some(master) = map.get(&removed.master_id).cloned()
            {
                map.insert(master.id.clone(), Arc::new(master.without_replica(id)));
            }
            Some(removed)
        })
    }

    #[must_use]
    pub fn storage_unit(&self, id: &StorageUnitId) -> Option<Arc<StorageUnitMeta>> {
        self.storage_units.load().get(id).cloned()
    }

    #[must_use]
    pub fn storage_units_by_ids(
        &self,
        ids: &HashSet<StorageUnitId>,
    ) -> HashMap<StorageUnitId, Arc<StorageUnitMeta>> {
        let map = self.storage_units.load();
        ids.iter()
            .filter_map(|id| map.get(id).map(|u| (id.clone(), Arc::clone(u))))
            .collect()
    }

    #[must_use]
    pub fn storage_units(&self) -> Vec<Arc<StorageUnitMeta>> {
        self.storage_units.load().values().cloned().collect()
    }

    /// Units placed on one storage engine
    #[must_use]
    pub fn storage_units_of_engine(&self, engine: StorageEngineId) -> Vec<Arc<StorageUnitMeta>> {
        self.storage_units
            .load()
            .values()
            .filter(|u| u.storage_engine_id == engine)
            .cloned()
            .collect()
    }

    /// Whether any managed (non-dummy) storage unit exists
    #[must_use]
    pub fn has_storage_unit(&self) -> bool {
        self.storage_units.load().values().any(|u| !u.dummy)
    }

    // ---- Storage engines ----

    /// Register an engine; false when it is already known
    pub fn add_storage_engine(&self, engine: StorageEngineMeta) -> bool {
        let mut engines = self.storage_engines.write();
        if engines.contains_key(&engine.id) {
            return false;
        }
        engines.insert(engine.id, Arc::new(engine));
        true
    }

    pub fn remove_storage_engine(&self, id: StorageEngineId) -> Option<Arc<StorageEngineMeta>> {
        self.storage_engines.write().remove(&id)
    }

    #[must_use]
    pub fn storage_engine(&self, id: StorageEngineId) -> Option<Arc<StorageEngineMeta>> {
        self.storage_engines.read().get(&id).cloned()
    }

    #[must_use]
    pub fn storage_engines(&self) -> Vec<Arc<StorageEngineMeta>> {
        self.storage_engines.read().values().cloned().collect()
    }

    // ---- Nodes ----

    pub fn add_node(&self, node: NodeMeta) {
        self.nodes.write().insert(node.id, node);
    }

    pub fn remove_node(&self, id: NodeId) {
        self.nodes.write().remove(&id);
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<NodeMeta> {
        self.nodes.read().get(&id).cloned()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<NodeMeta> {
        self.nodes.read().values().cloned().collect()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    // ---- Users ----

    pub fn put_user(&self, user: UserMeta) {
        self.users.write().insert(user.username.clone(), user);
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    #[must_use]
    pub fn user(&self, username: &str) -> Option<UserMeta> {
        self.users.read().get(username).cloned()
    }

    #[must_use]
    pub fn users(&self) -> Vec<UserMeta> {
        let mut users: Vec<_> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    // ---- Schema mappings ----

    pub fn put_schema_mapping(&self, namespace: &str, mapping: SchemaMapping) {
        self.schema_mappings
            .write()
            .insert(namespace.to_string(), mapping);
    }

    pub fn remove_schema_mapping(&self, namespace: &str) {
        self.schema_mappings.write().remove(namespace);
    }

    #[must_use]
    pub fn schema_mapping(&self, namespace: &str) -> Option<SchemaMapping> {
        self.schema_mappings.read().get(namespace).cloned()
    }

    #[must_use]
    pub fn schema_namespaces(&self) -> Vec<String> {
        self.schema_mappings.read().keys().cloned().collect()
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}

fn search_keys(list: &[FragmentMeta], keys: &KeyInterval) -> Vec<FragmentMeta> {
    list.iter()
        .take_while(|f| !f.keys.is_after(keys))
        .filter(|f| f.keys.intersects(keys))
        .cloned()
        .collect()
}

/// Rebuild master replica lists from each replica's `master_id`
pub fn link_replicas(units: Vec<StorageUnitMeta>) -> Vec<StorageUnitMeta> {
    let mut by_id: BTreeMap<StorageUnitId, StorageUnitMeta> = units
        .into_iter()
        .map(|mut u| {
            u.replicas.clear();
            (u.id.clone(), u)
        })
        .collect();
    let replicas: Vec<(StorageUnitId, StorageUnitId)> = by_id
        .values()
        .filter(|u| !u.is_master && u.state != StorageUnitState::Discard)
        .map(|u| (u.id.clone(), u.master_id.clone()))
        .collect();
    for (replica, master) in replicas {
        match by_id.get_mut(&master) {
            Some(m) => m.replicas.push(replica),
            None => error!("Storage unit {} references unknown master {}", replica, master),
        }
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(start: Option<&str>, end: Option<&str>, keys: KeyInterval, unit: &str) -> FragmentMeta {
        FragmentMeta::new(ColumnsRange::new(start, end), keys, StorageUnitId::from(unit))
    }

    #[test]
    fn test_split_routing() {
        let cache = MetaCache::new();
        cache.init_fragments(vec![
            fragment(Some("a"), Some("z"), KeyInterval::new(0, 100), "u1"),
            fragment(Some("a"), Some("m"), KeyInterval::from_start(100), "u2"),
        ]);

        let hits = cache.fragments_by_column_and_keys("b", &KeyInterval::new(150, 151));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].master_storage_unit_id.as_str(), "u2");

        let hits = cache.fragments_by_column_and_keys("b", &KeyInterval::new(50, 51));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].master_storage_unit_id.as_str(), "u1");
    }

    #[test]
    fn test_latest_fragment_map() {
        let cache = MetaCache::new();
        cache.init_fragments(vec![
            fragment(None, Some("m"), KeyInterval::new(0, 10), "u1"),
            fragment(None, Some("m"), KeyInterval::from_start(10), "u2"),
            fragment(Some("m"), None, KeyInterval::new(0, 10), "u3"),
        ]);
        let latest = cache.latest_fragments();
        assert_eq!(latest.len(), 1);
        assert_eq!(
            latest[&ColumnsRange::new(None::<String>, Some("m"))].master_storage_unit_id.as_str(),
            "u2"
        );
        assert!(cache.latest_fragment_by_column("z").is_none());
        assert_eq!(
            cache.latest_fragment_by_column("a").unwrap().keys,
            KeyInterval::from_start(10)
        );
    }

    #[test]
    fn test_upsert_replaces_same_start() {
        let cache = MetaCache::new();
        let open = fragment(None, None, KeyInterval::full(), "u1");
        cache.add_fragment(open.clone());
        cache.add_fragment(open.end_at(100));
        cache.add_fragment(fragment(None, None, KeyInterval::from_start(100), "u2"));
        assert_eq!(cache.fragment_count(), 2);
        let list = cache.fragments_by_exact_columns(&ColumnsRange::unbounded());
        assert_eq!(list[0].keys, KeyInterval::new(0, 100));
        assert_eq!(list[1].keys, KeyInterval::from_start(100));
        assert!(cache.remove_fragment(&list[1]));
        assert!(!cache.remove_fragment(&list[1]));
        assert_eq!(cache.fragment_count(), 1);
    }

    #[test]
    fn test_retention_evicts_oldest_generation() {
        // 1 KiB holds 16 fragments of 62 bytes
        let cache = MetaCache::with_threshold_kb(1);
        let mut fragments = Vec::new();
        for generation in 0..20 {
            let keys = if generation == 19 {
                KeyInterval::from_start(generation * 10)
            } else {
                KeyInterval::new(generation * 10, (generation + 1) * 10)
            };
            fragments.push(fragment(None, None, keys, "u1"));
        }
        cache.init_fragments(fragments);
        assert_eq!(cache.fragment_count(), 16);
        assert_eq!(cache.min_key(), 40);
        assert!(cache.has_fragment());
        assert!(cache
            .fragments_by_column_and_keys("x", &KeyInterval::new(0, 40))
            .is_empty());
        assert!(cache.latest_fragment_by_column("x").is_some());
    }

    #[test]
    fn test_storage_units_link_replicas() {
        let cache = MetaCache::new();
        let master = StorageUnitMeta::master(
            StorageUnitId::from("m"),
            StorageEngineId::new(1),
            NodeId::new(1),
        );
        let replica = StorageUnitMeta::replica(
            StorageUnitId::from("r"),
            StorageEngineId::new(2),
            StorageUnitId::from("m"),
            NodeId::new(1),
        );
        cache.init_storage_units(vec![replica, master]);
        let master = cache.storage_unit(&StorageUnitId::from("m")).unwrap();
        assert_eq!(master.replicas, vec![StorageUnitId::from("r")]);
        assert!(cache.has_storage_unit());
        assert_eq!(cache.storage_units_of_engine(StorageEngineId::new(2)).len(), 1);
    }

    #[test]
    fn test_apply_links_and_reports_changes() {
        let cache = MetaCache::new();
        let m = StorageUnitId::from("m");
        let master = StorageUnitMeta::master(m.clone(), StorageEngineId::new(1), NodeId::new(1));
        let replica = StorageUnitMeta::replica(
            StorageUnitId::from("r"),
            StorageEngineId::new(2),
            m.clone(),
            NodeId::new(1),
        );
        let changes = cache.apply_storage_units(vec![master.clone(), replica.clone()]);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.before.is_none()));
        let snapshot = cache.storage_unit(&m).unwrap();
        assert_eq!(snapshot.replicas, vec![StorageUnitId::from("r")]);

        // replaying the same records is a no-op
        assert!(cache.apply_storage_units(vec![master, replica.clone()]).is_empty());

        let mut discarded = replica;
        discarded.state = StorageUnitState::Discard;
        let changes = cache.apply_storage_units(vec![discarded]);
        assert_eq!(changes.len(), 2);
        assert!(cache.storage_unit(&m).unwrap().replicas.is_empty());
        assert_eq!(snapshot.replicas.len(), 1);
    }

    #[test]
    fn test_reparented_replica_moves_between_masters() {
        let cache = MetaCache::new();
        let old = StorageUnitId::from("m1");
        let new = StorageUnitId::from("m2");
        let r = StorageUnitId::from("r");
        cache.apply_storage_units(vec![
            StorageUnitMeta::master(old.clone(), StorageEngineId::new(1), NodeId::new(1)),
            StorageUnitMeta::replica(r.clone(), StorageEngineId::new(2), old.clone(), NodeId::new(1)),
            StorageUnitMeta::master(new.clone(), StorageEngineId::new(3), NodeId::new(1)),
        ]);
        let mut moved = StorageUnitMeta::replica(r.clone(), StorageEngineId::new(2), new.clone(), NodeId::new(1));
        moved.updated_by = NodeId::new(2);
        cache.apply_storage_units(vec![moved]);
        assert!(cache.storage_unit(&old).unwrap().replicas.is_empty());
        assert_eq!(cache.storage_unit(&new).unwrap().replicas, vec![r.clone()]);

        cache.remove_storage_unit(&r);
        assert!(cache.storage_unit(&new).unwrap().replicas.is_empty());
    }

    #[test]
    fn test_dummy_fragments_kept_apart() {
        let cache = MetaCache::new();
        let mut dummy = fragment(Some("root"), Some("root~"), KeyInterval::full(), "dummy0000000001");
        dummy.dummy_fragment = true;
        cache.add_dummy_fragment(dummy);
        assert!(!cache.has_fragment());
        assert!(cache.latest_fragments().is_empty());
        assert_eq!(
            cache
                .dummy_fragments_by_columns(&ColumnsRange::bounded("root.a", "root.b"))
                .len(),
            1
        );
        cache.remove_dummy_fragment(&StorageUnitId::from("dummy0000000001"));
        assert!(cache.dummy_fragments().is_empty());
    }
}
