//! The coordination store contract.
//!
//! Every middleware node talks to the same store. It offers named leased
//! locks, atomic multi-record writes, atomic counters, and a revisioned
//! stream of change notifications that every subscriber receives,
//! including the writer itself.

use crate::lock::{LockGuard, LockResource};
use crate::store::MetaStoreResult;
use crate::tables::Table;
use polystore_common::NodeId;
use tokio::sync::broadcast;

/// What happened to one record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created(Vec<u8>),
    Updated(Vec<u8>),
    Deleted,
}

impl ChangeKind {
    /// The new value, unless the record was deleted
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Created(v) | Self::Updated(v) => Some(v),
            Self::Deleted => None,
        }
    }
}

/// Notification of a committed write
///
/// All changes of one atomic write share the same revision. Revisions are
/// strictly increasing in publication order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub revision: u64,
    pub table: Table,
    pub key: String,
    pub kind: ChangeKind,
}

/// One record mutation inside an atomic write
#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
    Clear {
        table: Table,
    },
}

impl WriteOp {
    pub fn put(table: Table, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            table,
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        Self::Delete {
            table,
            key: key.into(),
        }
    }
}

/// Shared source of truth for cluster metadata
pub trait CoordinationStore: Send + Sync {
    /// Block until the named lock is held by `holder`
    fn lock(&self, resource: LockResource, holder: NodeId) -> MetaStoreResult<LockGuard>;

    fn get(&self, table: Table, key: &str) -> MetaStoreResult<Option<Vec<u8>>>;

    /// Every record of a table in key order
    fn scan(&self, table: Table) -> MetaStoreResult<Vec<(String, Vec<u8>)>>;

    /// Apply all operations atomically; returns the revision they were
    /// published under
    fn apply(&self, ops: Vec<WriteOp>) -> MetaStoreResult<u64>;

    /// Atomically add `delta` to a counter record and return the new value
    fn increment(&self, table: Table, key: &str, delta: i64) -> MetaStoreResult<i64>;

    /// Revision of the last published change
    fn revision(&self) -> u64;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    fn put(&self, table: Table, key: &str, value: Vec<u8>) -> MetaStoreResult<u64> {
        self.apply(vec![WriteOp::put(table, key, value)])
    }

    fn delete(&self, table: Table, key: &str) -> MetaStoreResult<u64> {
        self.apply(vec![WriteOp::delete(table, key)])
    }
}

/// Counter records are little-endian `i64`
#[must_use]
pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

#[must_use]
pub fn decode_counter(bytes: &[u8]) -> i64 {
    <[u8; 8]>::try_from(bytes).map_or(0, i64::from_le_bytes)
}
