//! Records persisted in the coordination store.
//!
//! These types are serialized to redb via bincode. Fields marked
//! `#[serde(skip)]` are derived state rebuilt by the cache on load.

use polystore_common::{
    ColumnsRange, KEY_MAX, KeyInterval, NodeId, Permission, StorageEngineId, StorageEngineKind,
    StorageUnitId, StorageUnitState, UserType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Size accounted per cached fragment
pub const FRAGMENT_META_SIZE: usize = 62;

/// A registered middleware node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub extra_params: BTreeMap<String, String>,
}

/// A backing storage engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEngineMeta {
    pub id: StorageEngineId,
    pub ip: String,
    pub port: u16,
    pub kind: StorageEngineKind,
    pub read_only: bool,
    /// Hosts data that was not written through PolyStore
    pub has_data: bool,
    pub data_prefix: Option<String>,
    pub schema_prefix: Option<String>,
    pub extra_params: BTreeMap<String, String>,
    pub created_by: NodeId,
    /// Boundary of the pre-existing data, resolved once at registration
    pub dummy_columns: Option<ColumnsRange>,
    pub dummy_keys: Option<KeyInterval>,
}

impl StorageEngineMeta {
    /// Writable engines receive new storage units
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        !self.read_only
    }

    /// The synthetic unit holding this engine's pre-existing data
    #[must_use]
    pub fn dummy_storage_unit(&self) -> Option<StorageUnitMeta> {
        if !self.has_data {
            return None;
        }
        let id = StorageUnitId::dummy(self.id);
        let mut unit = StorageUnitMeta::master(id, self.id, self.created_by);
        unit.dummy = true;
        Some(unit)
    }

    /// The synthetic fragment covering this engine's pre-existing data
    #[must_use]
    pub fn dummy_fragment(&self) -> Option<FragmentMeta> {
        if !self.has_data {
            return None;
        }
        let columns = self
            .dummy_columns
            .clone()
            .unwrap_or_else(ColumnsRange::unbounded)
            .with_schema_prefix(self.schema_prefix.clone());
        let keys = self.dummy_keys.unwrap_or_else(KeyInterval::full);
        let mut fragment = FragmentMeta::new(columns, keys, StorageUnitId::dummy(self.id));
        fragment.created_by = self.created_by;
        fragment.dummy_fragment = true;
        fragment.initial_fragment = false;
        Some(fragment)
    }
}

/// A replication group member
///
/// The master of a group has `master_id == id` and lists its replicas in
/// `replicas`. The list is not persisted; it is rebuilt from `master_id`
/// whenever units are loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnitMeta {
    pub id: StorageUnitId,
    pub storage_engine_id: StorageEngineId,
    pub master_id: StorageUnitId,
    pub is_master: bool,
    pub created_by: NodeId,
    pub updated_by: NodeId,
    pub initial_storage_unit: bool,
    pub dummy: bool,
    pub state: StorageUnitState,
    pub migration_to: Option<StorageUnitId>,
    #[serde(skip)]
    pub replicas: Vec<StorageUnitId>,
}

impl StorageUnitMeta {
    #[must_use]
    pub fn master(id: StorageUnitId, engine: StorageEngineId, created_by: NodeId) -> Self {
        Self {
            master_id: id.clone(),
            id,
            storage_engine_id: engine,
            is_master: true,
            created_by,
            updated_by: created_by,
            initial_storage_unit: true,
            dummy: false,
            state: StorageUnitState::Normal,
            migration_to: None,
            replicas: Vec::new(),
        }
    }

    #[must_use]
    pub fn replica(
        id: StorageUnitId,
        engine: StorageEngineId,
        master_id: StorageUnitId,
        created_by: NodeId,
    ) -> Self {
        Self {
            master_id,
            is_master: false,
            ..Self::master(id, engine, created_by)
        }
    }

    /// Snapshot with `replica` appended to the replica list, if missing
    #[must_use]
    pub fn with_replica(&self, replica: &StorageUnitId) -> Self {
        let mut next = self.clone();
        if !next.replicas.contains(replica) {
            next.replicas.push(replica.clone());
        }
        next
    }

    #[must_use]
    pub fn without_replica(&self, replica: &StorageUnitId) -> Self {
        let mut next = self.clone();
        next.replicas.retain(|r| r != replica);
        next
    }

    /// Equal in every persisted field
    #[must_use]
    pub fn same_record(&self, other: &Self) -> bool {
        self.id == other.id
            && self.storage_engine_id == other.storage_engine_id
            && self.master_id == other.master_id
            && self.is_master == other.is_master
            && self.created_by == other.created_by
            && self.updated_by == other.updated_by
            && self.initial_storage_unit == other.initial_storage_unit
            && self.dummy == other.dummy
            && self.state == other.state
            && self.migration_to == other.migration_to
    }
}

/// A shard: one columns range times one key interval, bound to a master unit
///
/// Two fragments are equal when they cover the same rectangle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub columns: ColumnsRange,
    pub keys: KeyInterval,
    pub created_by: NodeId,
    pub updated_by: NodeId,
    pub master_storage_unit_id: StorageUnitId,
    pub initial_fragment: bool,
    pub dummy_fragment: bool,
    /// Resolved master unit, backfilled by the cache
    #[serde(skip)]
    pub master_storage_unit: Option<Arc<StorageUnitMeta>>,
}

impl FragmentMeta {
    #[must_use]
    pub fn new(columns: ColumnsRange, keys: KeyInterval, master: StorageUnitId) -> Self {
        Self {
            columns,
            keys,
            created_by: NodeId::default(),
            updated_by: NodeId::default(),
            master_storage_unit_id: master,
            initial_fragment: true,
            dummy_fragment: false,
            master_storage_unit: None,
        }
    }

    /// Copy of this fragment with its key interval closed at `end_key`
    #[must_use]
    pub fn end_at(&self, end_key: i64) -> Self {
        Self {
            columns: self.columns.clone(),
            keys: self.keys.closed_at(end_key),
            created_by: self.created_by,
            updated_by: self.updated_by,
            master_storage_unit_id: self.master_storage_unit_id.clone(),
            initial_fragment: self.initial_fragment,
            dummy_fragment: self.dummy_fragment,
            master_storage_unit: self.master_storage_unit.clone(),
        }
    }

    #[must_use]
    pub const fn is_latest(&self) -> bool {
        self.keys.end() == KEY_MAX
    }
}

impl PartialEq for FragmentMeta {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns && self.keys == other.keys
    }
}

impl Eq for FragmentMeta {}

impl Hash for FragmentMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.columns.hash(state);
        self.keys.hash(state);
    }
}

/// A user account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMeta {
    pub username: String,
    pub password: String,
    pub user_type: UserType,
    pub permissions: BTreeSet<Permission>,
}

impl UserMeta {
    #[must_use]
    pub fn administrator(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            user_type: UserType::Administrator,
            permissions: Permission::ALL.into_iter().collect(),
        }
    }
}

/// A namespace-scoped column-name shortening map
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub version: u64,
    pub items: BTreeMap<String, i64>,
}

/// Read and write request counts for one fragment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentLoad {
    pub write: i64,
    pub read: i64,
}

/// Persisted failure-recovery plan for one storage engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub storage_engine_id: StorageEngineId,
    pub units: BTreeMap<StorageUnitId, StorageEngineId>,
    pub with_data: bool,
    pub created_by: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str) -> StorageUnitId {
        StorageUnitId::from(id)
    }

    #[test]
    fn test_fragment_identity() {
        let a = FragmentMeta::new(ColumnsRange::unbounded(), KeyInterval::full(), unit("u1"));
        let mut b = a.clone();
        b.created_by = NodeId::new(9);
        b.master_storage_unit_id = unit("u2");
        assert_eq!(a, b);
        assert_ne!(a, a.end_at(100));
        assert!(a.is_latest());
        assert!(!a.end_at(100).is_latest());
    }

    #[test]
    fn test_end_at_keeps_flags() {
        let mut fragment = FragmentMeta::new(
            ColumnsRange::bounded("a", "z"),
            KeyInterval::full(),
            unit("unit0000000001"),
        );
        fragment.created_by = NodeId::new(2);
        fragment.initial_fragment = false;
        let ended = fragment.end_at(100);
        assert_eq!(ended.keys, KeyInterval::new(0, 100));
        assert_eq!(ended.created_by, NodeId::new(2));
        assert!(!ended.initial_fragment);
        assert_eq!(ended.master_storage_unit_id, unit("unit0000000001"));
    }

    #[test]
    fn test_replica_list_snapshots() {
        let master = StorageUnitMeta::master(unit("m"), StorageEngineId::new(1), NodeId::new(1));
        let with_r1 = master.with_replica(&unit("r1")).with_replica(&unit("r2"));
        assert_eq!(with_r1.with_replica(&unit("r1")).replicas.len(), 2);
        let without = with_r1.without_replica(&unit("r1")).with_replica(&unit("r3"));
        assert_eq!(without.replicas, vec![unit("r2"), unit("r3")]);
        assert!(without.same_record(&master));
        assert!(master.replicas.is_empty());
    }

    #[test]
    fn test_replicas_not_persisted() {
        let master = StorageUnitMeta::master(unit("m"), StorageEngineId::new(1), NodeId::new(1))
            .with_replica(&unit("r1"));
        let bytes = bincode::serialize(&master).unwrap();
        let decoded: StorageUnitMeta = bincode::deserialize(&bytes).unwrap();
        assert!(decoded.replicas.is_empty());
        assert_eq!(decoded.id, master.id);
    }

    #[test]
    fn test_dummy_records() {
        let engine = StorageEngineMeta {
            id: StorageEngineId::new(4),
            ip: "127.0.0.1".into(),
            port: 6667,
            kind: StorageEngineKind::IoTDB,
            read_only: true,
            has_data: true,
            data_prefix: Some("root".into()),
            schema_prefix: None,
            extra_params: BTreeMap::new(),
            created_by: NodeId::new(1),
            dummy_columns: Some(ColumnsRange::prefix("root").unwrap()),
            dummy_keys: Some(KeyInterval::new(0, 1000)),
        };
        let unit = engine.dummy_storage_unit().unwrap();
        assert_eq!(unit.id.as_str(), "dummy0000000004");
        assert!(unit.dummy && unit.is_master);
        let fragment = engine.dummy_fragment().unwrap();
        assert!(fragment.dummy_fragment);
        assert_eq!(fragment.master_storage_unit_id, unit.id);
        assert_eq!(fragment.keys, KeyInterval::new(0, 1000));
        assert!(!engine.is_writable());
    }
}
