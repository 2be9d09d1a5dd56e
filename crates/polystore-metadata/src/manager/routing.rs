//! Routing queries: which fragments, and which units, serve a request.
//!
//! Recent fragments come from the cache. With a retention window, the part
//! of a query older than the window's min key is read from the store.

use super::MetaManager;
use polystore_common::{ColumnsRange, KeyInterval, StorageUnitState};
use polystore_meta_store::{FragmentMeta, StorageUnitMeta};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

type FragmentMap = BTreeMap<ColumnsRange, Vec<FragmentMeta>>;

/// Upper bound on `migration_to` hops when resolving a discarded unit
const MAX_MIGRATION_HOPS: usize = 16;

impl MetaManager {
    /// The unit currently serving a fragment, following finished migrations
    fn serving_unit(&self, fragment: &FragmentMeta) -> Option<Arc<StorageUnitMeta>> {
        let mut unit = self.cache.storage_unit(&fragment.master_storage_unit_id)?;
        for _ in 0..MAX_MIGRATION_HOPS {
            if unit.state != StorageUnitState::Discard {
                return Some(unit);
            }
            let next = unit.migration_to.as_ref().and_then(|t| self.cache.storage_unit(t));
            match next {
                Some(next) => unit = next,
                None => return Some(unit),
            }
        }
        warn!(
            "Migration chain of storage unit {} is too long",
            fragment.master_storage_unit_id
        );
        Some(unit)
    }

    fn resolve(&self, mut fragment: FragmentMeta) -> FragmentMeta {
        if fragment.master_storage_unit.is_none() {
            fragment.master_storage_unit = self.serving_unit(&fragment);
        }
        fragment
    }

    fn resolve_all(&self, fragments: Vec<FragmentMeta>) -> Vec<FragmentMeta> {
        fragments.into_iter().map(|f| self.resolve(f)).collect()
    }

    /// Key interval older than the retention window, if `keys` reaches it
    fn evicted_slice(&self, keys: &KeyInterval) -> Option<KeyInterval> {
        if !self.cache.retention_enabled() {
            return None;
        }
        let min_key = self.cache.min_key();
        (keys.start() < min_key).then(|| KeyInterval::new(keys.start(), keys.end().min(min_key)))
    }

    fn stored_fragments(&self, columns: &ColumnsRange, keys: &KeyInterval) -> Vec<FragmentMeta> {
        self.run("load fragments outside the cache", || {
            Ok(self.records.fragments_in(columns, keys)?)
        })
        .unwrap_or_default()
    }

    /// Fragment lists of every columns range intersecting `columns`,
    /// ordered by start key
    ///
    /// Dummy fragments are merged in only when `include_dummy` is set.
    #[must_use]
    pub fn fragments_by_columns(
        &self,
        columns: &ColumnsRange,
        keys: Option<&KeyInterval>,
        include_dummy: bool,
    ) -> FragmentMap {
        let mut result = match keys {
            Some(keys) => self.cache.fragments_by_columns_and_keys(columns, keys),
            None => self.cache.fragments_by_columns(columns),
        };
        let requested = keys.copied().unwrap_or_else(KeyInterval::full);
        if let Some(older) = self.evicted_slice(&requested) {
            for fragment in self.stored_fragments(columns, &older) {
                result
                    .entry(fragment.columns.clone())
                    .or_default()
                    .push(fragment);
            }
            for list in result.values_mut() {
                list.sort_by_key(|f| f.keys.start());
                list.dedup_by_key(|f| f.keys.start());
            }
        }
        if include_dummy {
            let dummies = match keys {
                Some(keys) => self.cache.dummy_fragments_by_columns_and_keys(columns, keys),
                None => self.cache.dummy_fragments_by_columns(columns),
            };
            for fragment in dummies {
                result
                    .entry(fragment.columns.clone())
                    .or_default()
                    .push(fragment);
            }
        }
        result
            .into_iter()
            .map(|(range, list)| (range, self.resolve_all(list)))
            .collect()
    }

    /// Every fragment whose columns range contains `column`
    #[must_use]
    pub fn fragments_by_column(&self, column: &str) -> Vec<FragmentMeta> {
        self.fragments_by_column_and_keys(column, &KeyInterval::full())
    }

    #[must_use]
    pub fn fragments_by_column_and_keys(&self, column: &str, keys: &KeyInterval) -> Vec<FragmentMeta> {
        let mut fragments = self.cache.fragments_by_column_and_keys(column, keys);
        if let Some(older) = self.evicted_slice(keys) {
            fragments.extend(
                self.stored_fragments(&ColumnsRange::unbounded(), &older)
                    .into_iter()
                    .filter(|f| f.columns.contains(column)),
            );
            fragments.sort_by(|a, b| {
                a.columns
                    .cmp(&b.columns)
                    .then(a.keys.start().cmp(&b.keys.start()))
            });
            fragments.dedup_by(|a, b| a.columns == b.columns && a.keys.start() == b.keys.start());
        }
        self.resolve_all(fragments)
    }

    /// The open-ended fragment of every columns range
    #[must_use]
    pub fn latest_fragment_map(&self) -> BTreeMap<ColumnsRange, FragmentMeta> {
        self.cache
            .latest_fragments()
            .into_iter()
            .map(|(range, f)| (range, self.resolve(f)))
            .collect()
    }

    #[must_use]
    pub fn latest_fragment_map_by_columns(
        &self,
        columns: &ColumnsRange,
    ) -> BTreeMap<ColumnsRange, FragmentMeta> {
        self.cache
            .latest_fragments_by_columns(columns)
            .into_iter()
            .map(|(range, f)| (range, self.resolve(f)))
            .collect()
    }

    /// First open-ended fragment intersecting `columns`
    #[must_use]
    pub fn latest_fragment(&self, columns: &ColumnsRange) -> Option<FragmentMeta> {
        self.latest_fragment_map_by_columns(columns)
            .into_values()
            .next()
    }

    #[must_use]
    pub fn latest_fragment_by_column(&self, column: &str) -> Option<FragmentMeta> {
        self.cache
            .latest_fragment_by_column(column)
            .map(|f| self.resolve(f))
    }

    #[must_use]
    pub fn has_dummy_fragment(&self, columns: &ColumnsRange) -> bool {
        !self.cache.dummy_fragments_by_columns(columns).is_empty()
    }

    /// Every dummy fragment, one per storage engine holding unmanaged data
    #[must_use]
    pub fn dummy_fragments(&self) -> Vec<FragmentMeta> {
        self.resolve_all(self.cache.dummy_fragments())
    }
}
