//! Coordination store backed by redb.
//!
//! One `RedbCoordinationStore` is shared by every node of a cluster running
//! in one process (or by a single node over a file). All writes are
//! synchronous (write txn + commit); the change notification is published
//! after the commit, under the same commit lock, so subscribers observe
//! revisions in order.

use crate::coordination::{ChangeEvent, ChangeKind, CoordinationStore, WriteOp, decode_counter, encode_counter};
use crate::lock::{LeaseTable, LockGuard, LockResource};
use crate::tables::Table;
use parking_lot::Mutex;
use polystore_common::config::{MetaConfig, NodeConfig};
use polystore_common::{Error, NodeId};
use redb::{Database, ReadableTable};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Error type for coordination store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for lock: {resource}")]
    LockTimeout { resource: String },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::LockTimeout { resource } => Self::LockTimeout { resource },
            MetaStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::CoordinationStore(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Tunables of a store instance
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub watch_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&MetaConfig::default())
    }
}

impl From<&MetaConfig> for StoreOptions {
    fn from(config: &MetaConfig) -> Self {
        Self {
            lock_lease: Duration::from_millis(config.lock_lease_ms),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
            watch_capacity: config.watch_capacity,
        }
    }
}

/// Coordination store backed by a redb database
pub struct RedbCoordinationStore {
    db: Database,
    leases: Arc<LeaseTable>,
    revision: AtomicU64,
    commit: Mutex<()>,
    events: broadcast::Sender<ChangeEvent>,
}

impl RedbCoordinationStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        info!("Opened coordination store at {}", path.display());
        Self::with_database(db, options)
    }

    /// A store that lives only as long as this process
    pub fn in_memory(options: &StoreOptions) -> MetaStoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::with_database(db, options)
    }

    /// Open the store described by the node configuration
    pub fn from_config(meta: &MetaConfig, node: &NodeConfig) -> MetaStoreResult<Self> {
        let options = StoreOptions::from(meta);
        if meta.in_memory {
            Self::in_memory(&options)
        } else {
            Self::open(meta.store_path(node), &options)
        }
    }

    fn with_database(db: Database, options: &StoreOptions) -> MetaStoreResult<Self> {
        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for table in Table::ALL {
            let _t = write_txn.open_table(table.definition())?;
        }
        write_txn.commit()?;

        let (events, _) = broadcast::channel(options.watch_capacity.max(1));
        Ok(Self {
            db,
            leases: Arc::new(LeaseTable::new(options.lock_lease, options.lock_wait)),
            revision: AtomicU64::new(0),
            commit: Mutex::new(()),
            events,
        })
    }

    /// Bump the revision and notify subscribers; caller holds `commit`
    fn publish(&self, changes: Vec<(Table, String, ChangeKind)>) -> u64 {
        if changes.is_empty() {
            return self.revision.load(Ordering::SeqCst);
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        for (table, key, kind) in changes {
            // no subscribers is fine
            let _ = self.events.send(ChangeEvent {
                revision,
                table,
                key,
                kind,
            });
        }
        revision
    }
}

impl CoordinationStore for RedbCoordinationStore {
    fn lock(&self, resource: LockResource, holder: NodeId) -> MetaStoreResult<LockGuard> {
        self.leases.acquire(resource, holder)
    }

    fn get(&self, table: Table, key: &str) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan(&self, table: Table) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;
        let mut result = Vec::new();
        for entry in t.iter()? {
            let (key, value) = entry?;
            result.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(result)
    }

    fn apply(&self, ops: Vec<WriteOp>) -> MetaStoreResult<u64> {
        let _commit = self.commit.lock();
        let write_txn = self.db.begin_write()?;
        let mut changes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    let mut t = write_txn.open_table(table.definition())?;
                    let existed = t.insert(key.as_str(), value.as_slice())?.is_some();
                    let kind = if existed {
                        ChangeKind::Updated(value)
                    } else {
                        ChangeKind::Created(value)
                    };
                    changes.push((table, key, kind));
                }
                WriteOp::Delete { table, key } => {
                    let mut t = write_txn.open_table(table.definition())?;
                    if t.remove(key.as_str())?.is_some() {
                        changes.push((table, key, ChangeKind::Deleted));
                    }
                }
                WriteOp::Clear { table } => {
                    let mut t = write_txn.open_table(table.definition())?;
                    let mut keys = Vec::new();
                    for entry in t.iter()? {
                        keys.push(entry?.0.value().to_string());
                    }
                    for key in keys {
                        t.remove(key.as_str())?;
                        changes.push((table, key, ChangeKind::Deleted));
                    }
                }
            }
        }
        if let Err(e) = write_txn.commit() {
            error!("Failed to commit coordination store write: {}", e);
            return Err(e.into());
        }
        Ok(self.publish(changes))
    }

    fn increment(&self, table: Table, key: &str, delta: i64) -> MetaStoreResult<i64> {
        let _commit = self.commit.lock();
        let write_txn = self.db.begin_write()?;
        let (value, existed) = {
            let mut t = write_txn.open_table(table.definition())?;
            let current = t.get(key)?.map(|v| decode_counter(v.value()));
            let value = current.unwrap_or(0) + delta;
            t.insert(key, encode_counter(value).as_slice())?;
            (value, current.is_some())
        };
        write_txn.commit()?;
        let bytes = encode_counter(value);
        let kind = if existed {
            ChangeKind::Updated(bytes)
        } else {
            ChangeKind::Created(bytes)
        };
        self.publish(vec![(table, key.to_string(), kind)]);
        Ok(value)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> RedbCoordinationStore {
        RedbCoordinationStore::in_memory(&StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let store = store();
        assert_eq!(store.get(Table::Users, "root").unwrap(), None);
        store.put(Table::Users, "root", b"v1".to_vec()).unwrap();
        assert_eq!(store.get(Table::Users, "root").unwrap(), Some(b"v1".to_vec()));
        store.delete(Table::Users, "root").unwrap();
        assert_eq!(store.get(Table::Users, "root").unwrap(), None);
    }

    #[test]
    fn test_events_carry_kind_and_revision() {
        let store = store();
        let mut rx = store.subscribe();
        store.put(Table::Nodes, "a", b"1".to_vec()).unwrap();
        store.put(Table::Nodes, "a", b"2".to_vec()).unwrap();
        store.delete(Table::Nodes, "a").unwrap();
        // deleting a missing key publishes nothing
        store.delete(Table::Nodes, "a").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(first.kind, ChangeKind::Created(b"1".to_vec()));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.kind, ChangeKind::Updated(b"2".to_vec()));
        let third = rx.try_recv().unwrap();
        assert_eq!(third.kind, ChangeKind::Deleted);
        assert_eq!(third.revision, 3);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.revision(), 3);
    }

    #[test]
    fn test_batch_shares_revision() {
        let store = store();
        let mut rx = store.subscribe();
        let revision = store
            .apply(vec![
                WriteOp::put(Table::StorageUnits, "u1", b"x".to_vec()),
                WriteOp::put(Table::Fragments, "f1", b"y".to_vec()),
            ])
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().revision, revision);
        assert_eq!(rx.try_recv().unwrap().revision, revision);
    }

    #[test]
    fn test_increment_and_clear() {
        let store = store();
        assert_eq!(store.increment(Table::Counters, "c", 1).unwrap(), 1);
        assert_eq!(store.increment(Table::Counters, "c", 5).unwrap(), 6);
        assert_eq!(store.increment(Table::Counters, "c", -6).unwrap(), 0);

        store.put(Table::FragmentHeat, "a", b"1".to_vec()).unwrap();
        store.put(Table::FragmentHeat, "b", b"1".to_vec()).unwrap();
        store.apply(vec![WriteOp::Clear { table: Table::FragmentHeat }]).unwrap();
        assert!(store.scan(Table::FragmentHeat).unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("meta.redb");
        {
            let store = RedbCoordinationStore::open(&path, &StoreOptions::default()).unwrap();
            store.put(Table::Users, "root", b"admin".to_vec()).unwrap();
        }
        let store = RedbCoordinationStore::open(&path, &StoreOptions::default()).unwrap();
        assert_eq!(store.get(Table::Users, "root").unwrap(), Some(b"admin".to_vec()));
        assert_eq!(store.scan(Table::Users).unwrap().len(), 1);
    }
}
