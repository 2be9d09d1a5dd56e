//! Typed access to the coordination store's record classes.
//!
//! `MetaRecords` owns the key layout and the bincode encoding of every
//! record class; the metadata manager never touches raw bytes.

use crate::coordination::{CoordinationStore, WriteOp, decode_counter, encode_counter};
use crate::lock::{LockGuard, LockResource};
use crate::store::{MetaStoreError, MetaStoreResult};
use crate::tables::Table;
use crate::types::{
    FragmentLoad, FragmentMeta, MigrationPlan, NodeMeta, SchemaMapping, StorageEngineMeta,
    StorageUnitMeta, UserMeta,
};
use polystore_common::{
    ColumnsRange, KeyInterval, NodeId, ReshardStatus, StorageEngineId, StorageUnitId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Well-known keys of the `counters`, `reshard_status` and `statistics` tables
pub mod keys {
    pub const NODE_SEQ: &str = "node_seq";
    pub const STORAGE_ENGINE_SEQ: &str = "storage_engine_seq";
    pub const STORAGE_UNIT_SEQ: &str = "storage_unit_seq";
    pub const RESHARD_COUNTER: &str = "reshard_counter";
    pub const FRAGMENT_REQUESTS_COUNTER: &str = "fragment_requests_counter";
    pub const FRAGMENT_HEAT_COUNTER: &str = "fragment_heat_counter";
    pub const MAX_ACTIVE_END_KEY_COUNTER: &str = "max_active_end_key_counter";
    pub const RESHARD_STATUS: &str = "status";
    pub const MAX_ACTIVE_END_KEY: &str = "max_active_end_key";
}

const SEP: char = '\u{1}';

fn encode_border(border: Option<&str>) -> String {
    border.map_or_else(|| "n".to_string(), |b| format!("s{b}"))
}

fn decode_border(part: &str) -> Option<Option<String>> {
    match part.split_at_checked(1)? {
        ("n", "") => Some(None),
        ("s", rest) => Some(Some(rest.to_string())),
        _ => None,
    }
}

/// Flip the sign bit so that the decimal text of every key, negative
/// ones included, sorts in key order
const fn encode_start_key(start_key: i64) -> u64 {
    start_key.cast_unsigned() ^ (1 << 63)
}

const fn decode_start_key(encoded: u64) -> i64 {
    (encoded ^ (1 << 63)).cast_signed()
}

/// Key of a fragment record: its columns range plus its start key
#[must_use]
pub fn fragment_key(columns: &ColumnsRange, start_key: i64) -> String {
    format!(
        "{}{SEP}{}{SEP}{:020}",
        encode_border(columns.start()),
        encode_border(columns.end()),
        encode_start_key(start_key)
    )
}

/// Inverse of [`fragment_key`]
#[must_use]
pub fn parse_fragment_key(key: &str) -> Option<(ColumnsRange, i64)> {
    let mut parts = key.split(SEP);
    let start = decode_border(parts.next()?)?;
    let end = decode_border(parts.next()?)?;
    let start_key = decode_start_key(parts.next()?.parse().ok()?);
    if parts.next().is_some() {
        return None;
    }
    Some((ColumnsRange::new(start, end), start_key))
}

fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// Id of a node, storage engine or migration plan record key
#[must_use]
pub fn parse_id_key(key: &str) -> Option<u64> {
    key.parse().ok()
}

/// Decode the value carried by a change notification
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> MetaStoreResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Typed facade over a [`CoordinationStore`]
#[derive(Clone)]
pub struct MetaRecords {
    store: Arc<dyn CoordinationStore>,
}

impl MetaRecords {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn lock(&self, resource: LockResource, holder: NodeId) -> MetaStoreResult<LockGuard> {
        self.store.lock(resource, holder)
    }

    // ---- Nodes ----

    /// Allocate a node id and persist the node record
    pub fn register_node(
        &self,
        ip: &str,
        port: u16,
        extra_params: BTreeMap<String, String>,
    ) -> MetaStoreResult<NodeMeta> {
        let id = self.next_sequence(keys::NODE_SEQ)?;
        let node = NodeMeta {
            id: NodeId::new(id),
            ip: ip.to_string(),
            port,
            extra_params,
        };
        self.put_bincode(Table::Nodes, &id_key(id), &node)?;
        Ok(node)
    }

    pub fn unregister_node(&self, id: NodeId) -> MetaStoreResult<()> {
        self.store.delete(Table::Nodes, &id_key(id.as_u64()))?;
        Ok(())
    }

    pub fn load_nodes(&self) -> MetaStoreResult<Vec<NodeMeta>> {
        self.load_bincode_table(Table::Nodes)
    }

    // ---- Storage engines ----

    pub fn next_storage_engine_id(&self) -> MetaStoreResult<StorageEngineId> {
        self.next_sequence(keys::STORAGE_ENGINE_SEQ)
            .map(StorageEngineId::new)
    }

    pub fn put_storage_engine(&self, engine: &StorageEngineMeta) -> MetaStoreResult<()> {
        self.put_bincode(Table::StorageEngines, &id_key(engine.id.as_u64()), engine)
    }

    pub fn remove_storage_engine(&self, id: StorageEngineId) -> MetaStoreResult<()> {
        self.store
            .delete(Table::StorageEngines, &id_key(id.as_u64()))?;
        Ok(())
    }

    pub fn load_storage_engines(&self) -> MetaStoreResult<Vec<StorageEngineMeta>> {
        self.load_bincode_table(Table::StorageEngines)
    }

    // ---- Storage units ----

    pub fn allocate_storage_unit_id(&self) -> MetaStoreResult<StorageUnitId> {
        self.next_sequence(keys::STORAGE_UNIT_SEQ)
            .map(StorageUnitId::from_sequence)
    }

    pub fn storage_unit(&self, id: &StorageUnitId) -> MetaStoreResult<Option<StorageUnitMeta>> {
        self.get_bincode(Table::StorageUnits, id.as_str())
    }

    pub fn load_storage_units(&self) -> MetaStoreResult<Vec<StorageUnitMeta>> {
        self.load_bincode_table(Table::StorageUnits)
    }

    /// Ops persisting a unit, for use in a larger atomic write
    pub fn storage_unit_op(unit: &StorageUnitMeta) -> MetaStoreResult<WriteOp> {
        Ok(WriteOp::put(
            Table::StorageUnits,
            unit.id.as_str(),
            bincode::serialize(unit)?,
        ))
    }

    pub fn put_storage_units(&self, units: &[StorageUnitMeta]) -> MetaStoreResult<()> {
        let ops = units
            .iter()
            .map(Self::storage_unit_op)
            .collect::<MetaStoreResult<Vec<_>>>()?;
        self.store.apply(ops)?;
        Ok(())
    }

    pub fn remove_storage_unit(&self, id: &StorageUnitId) -> MetaStoreResult<()> {
        self.store.delete(Table::StorageUnits, id.as_str())?;
        Ok(())
    }

    // ---- Fragments ----

    pub fn fragment_op(fragment: &FragmentMeta) -> MetaStoreResult<WriteOp> {
        Ok(WriteOp::put(
            Table::Fragments,
            fragment_key(&fragment.columns, fragment.keys.start()),
            bincode::serialize(fragment)?,
        ))
    }

    pub fn put_fragments(&self, fragments: &[FragmentMeta]) -> MetaStoreResult<()> {
        let ops = fragments
            .iter()
            .map(Self::fragment_op)
            .collect::<MetaStoreResult<Vec<_>>>()?;
        self.store.apply(ops)?;
        Ok(())
    }

    pub fn fragment(
        &self,
        columns: &ColumnsRange,
        start_key: i64,
    ) -> MetaStoreResult<Option<FragmentMeta>> {
        self.get_bincode(Table::Fragments, &fragment_key(columns, start_key))
    }

    pub fn put_fragment(&self, fragment: &FragmentMeta) -> MetaStoreResult<()> {
        self.put_fragments(std::slice::from_ref(fragment))
    }

    pub fn remove_fragment(&self, fragment: &FragmentMeta) -> MetaStoreResult<()> {
        self.store.delete(
            Table::Fragments,
            &fragment_key(&fragment.columns, fragment.keys.start()),
        )?;
        Ok(())
    }

    /// Move a fragment record whose columns range changed
    pub fn replace_fragment(
        &self,
        old_columns: &ColumnsRange,
        fragment: &FragmentMeta,
    ) -> MetaStoreResult<()> {
        self.store.apply(vec![
            WriteOp::delete(
                Table::Fragments,
                fragment_key(old_columns, fragment.keys.start()),
            ),
            Self::fragment_op(fragment)?,
        ])?;
        Ok(())
    }

    pub fn load_fragments(&self) -> MetaStoreResult<Vec<FragmentMeta>> {
        self.load_bincode_table(Table::Fragments)
    }

    /// Persisted fragments intersecting a columns range and a key interval
    pub fn fragments_in(
        &self,
        columns: &ColumnsRange,
        keys: &KeyInterval,
    ) -> MetaStoreResult<Vec<FragmentMeta>> {
        Ok(self
            .load_fragments()?
            .into_iter()
            .filter(|f| f.columns.intersects(columns) && f.keys.intersects(keys))
            .collect())
    }

    // ---- Schema mappings ----

    pub fn schema_mapping(&self, namespace: &str) -> MetaStoreResult<Option<SchemaMapping>> {
        self.get_bincode(Table::SchemaMappings, namespace)
    }

    pub fn put_schema_mapping(
        &self,
        namespace: &str,
        mapping: &SchemaMapping,
    ) -> MetaStoreResult<()> {
        self.put_bincode(Table::SchemaMappings, namespace, mapping)
    }

    pub fn remove_schema_mapping(&self, namespace: &str) -> MetaStoreResult<()> {
        self.store.delete(Table::SchemaMappings, namespace)?;
        Ok(())
    }

    pub fn load_schema_mappings(&self) -> MetaStoreResult<Vec<(String, SchemaMapping)>> {
        self.load_keyed_bincode_table(Table::SchemaMappings)
    }

    // ---- Users ----

    pub fn put_user(&self, user: &UserMeta) -> MetaStoreResult<()> {
        self.put_bincode(Table::Users, &user.username, user)
    }

    pub fn remove_user(&self, username: &str) -> MetaStoreResult<()> {
        self.store.delete(Table::Users, username)?;
        Ok(())
    }

    pub fn load_users(&self) -> MetaStoreResult<Vec<UserMeta>> {
        self.load_bincode_table(Table::Users)
    }

    // ---- Fragment statistics ----

    /// Add request counts to the per-fragment records of `table`
    ///
    /// Read-modify-write; callers hold the matching counter lock.
    pub fn accumulate_fragment_load(
        &self,
        table: Table,
        loads: &[(FragmentMeta, FragmentLoad)],
    ) -> MetaStoreResult<()> {
        let mut ops = Vec::with_capacity(loads.len());
        for (fragment, delta) in loads {
            let key = fragment_key(&fragment.columns, fragment.keys.start());
            let mut load: FragmentLoad = self.get_bincode(table, &key)?.unwrap_or_default();
            load.write += delta.write;
            load.read += delta.read;
            ops.push(WriteOp::put(table, key, bincode::serialize(&load)?));
        }
        self.store.apply(ops)?;
        Ok(())
    }

    pub fn load_fragment_loads(
        &self,
        table: Table,
    ) -> MetaStoreResult<Vec<((ColumnsRange, i64), FragmentLoad)>> {
        Ok(self
            .load_keyed_bincode_table::<FragmentLoad>(table)?
            .into_iter()
            .filter_map(|(key, load)| parse_fragment_key(&key).map(|k| (k, load)))
            .collect())
    }

    pub fn put_fragment_points(&self, points: &[(FragmentMeta, i64)]) -> MetaStoreResult<()> {
        let ops = points
            .iter()
            .map(|(fragment, points)| {
                WriteOp::put(
                    Table::FragmentPoints,
                    fragment_key(&fragment.columns, fragment.keys.start()),
                    encode_counter(*points),
                )
            })
            .collect();
        self.store.apply(ops)?;
        Ok(())
    }

    pub fn load_fragment_points(&self) -> MetaStoreResult<Vec<((ColumnsRange, i64), i64)>> {
        Ok(self
            .store
            .scan(Table::FragmentPoints)?
            .into_iter()
            .filter_map(|(key, bytes)| parse_fragment_key(&key).map(|k| (k, decode_counter(&bytes))))
            .collect())
    }

    pub fn clear_table(&self, table: Table) -> MetaStoreResult<()> {
        self.store.apply(vec![WriteOp::Clear { table }])?;
        Ok(())
    }

    // ---- Counters and reshard coordination ----

    pub fn counter(&self, key: &str) -> MetaStoreResult<i64> {
        Ok(self
            .store
            .get(Table::Counters, key)?
            .map_or(0, |bytes| decode_counter(&bytes)))
    }

    pub fn increment_counter(&self, key: &str, delta: i64) -> MetaStoreResult<i64> {
        self.store.increment(Table::Counters, key, delta)
    }

    pub fn reset_counter(&self, key: &str) -> MetaStoreResult<()> {
        self.store.put(Table::Counters, key, encode_counter(0))?;
        Ok(())
    }

    pub fn reshard_status(&self) -> MetaStoreResult<ReshardStatus> {
        Ok(self
            .get_bincode(Table::ReshardStatus, keys::RESHARD_STATUS)?
            .unwrap_or_default())
    }

    pub fn put_reshard_status(&self, status: ReshardStatus) -> MetaStoreResult<()> {
        self.put_bincode(Table::ReshardStatus, keys::RESHARD_STATUS, &status)
    }

    /// Raise the shared max active end key to at least `end_key`
    ///
    /// Read-modify-write; callers hold the statistics lock.
    pub fn merge_max_active_end_key(&self, end_key: i64) -> MetaStoreResult<i64> {
        let current = self
            .store
            .get(Table::Statistics, keys::MAX_ACTIVE_END_KEY)?
            .map(|bytes| decode_counter(&bytes));
        let merged = current.map_or(end_key, |c| c.max(end_key));
        if current != Some(merged) {
            self.store.put(
                Table::Statistics,
                keys::MAX_ACTIVE_END_KEY,
                encode_counter(merged),
            )?;
        }
        Ok(merged)
    }

    pub fn max_active_end_key(&self) -> MetaStoreResult<Option<i64>> {
        Ok(self
            .store
            .get(Table::Statistics, keys::MAX_ACTIVE_END_KEY)?
            .map(|bytes| decode_counter(&bytes)))
    }

    // ---- Migration plans ----

    pub fn put_migration_plan(&self, plan: &MigrationPlan) -> MetaStoreResult<()> {
        self.put_bincode(
            Table::MigrationPlans,
            &id_key(plan.storage_engine_id.as_u64()),
            plan,
        )
    }

    pub fn migration_plan(&self, engine: StorageEngineId) -> MetaStoreResult<Option<MigrationPlan>> {
        self.get_bincode(Table::MigrationPlans, &id_key(engine.as_u64()))
    }

    pub fn remove_migration_plan(&self, engine: StorageEngineId) -> MetaStoreResult<()> {
        self.store
            .delete(Table::MigrationPlans, &id_key(engine.as_u64()))?;
        Ok(())
    }

    // ---- Generic helpers ----

    fn next_sequence(&self, key: &str) -> MetaStoreResult<u64> {
        let value = self.store.increment(Table::Counters, key, 1)?;
        u64::try_from(value).map_err(|_| MetaStoreError::Corrupt(format!("sequence {key} = {value}")))
    }

    fn put_bincode<T: Serialize>(&self, table: Table, key: &str, value: &T) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        if let Err(e) = self.store.put(table, key, bytes) {
            error!("Failed to persist {:?} record '{}': {}", table, key, e);
            return Err(e);
        }
        Ok(())
    }

    fn get_bincode<T: DeserializeOwned>(&self, table: Table, key: &str) -> MetaStoreResult<Option<T>> {
        match self.store.get(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_keyed_bincode_table<T: DeserializeOwned>(
        &self,
        table: Table,
    ) -> MetaStoreResult<Vec<(String, T)>> {
        let mut result = Vec::new();
        for (key, bytes) in self.store.scan(table)? {
            match bincode::deserialize::<T>(&bytes) {
                Ok(val) => result.push((key, val)),
                Err(e) => error!("Failed to decode {:?} entry '{}': {}", table, key, e),
            }
        }
        Ok(result)
    }

    fn load_bincode_table<T: DeserializeOwned>(&self, table: Table) -> MetaStoreResult<Vec<T>> {
        Ok(self
            .load_keyed_bincode_table(table)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }
}
