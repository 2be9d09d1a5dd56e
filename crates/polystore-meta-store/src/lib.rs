//! PolyStore Metadata Store - the shared coordination store
//!
//! This crate defines the contract every middleware node relies on to agree
//! on cluster topology (named locks, atomic writes, change notifications)
//! and implements it over redb, either file-backed or in memory.

pub mod coordination;
pub mod lock;
pub mod records;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use coordination::{ChangeEvent, ChangeKind, CoordinationStore, WriteOp};
pub use lock::{LockGuard, LockResource};
pub use records::MetaRecords;
pub use store::{MetaStoreError, MetaStoreResult, RedbCoordinationStore, StoreOptions};
pub use tables::Table;
pub use types::{
    FRAGMENT_META_SIZE, FragmentLoad, FragmentMeta, MigrationPlan, NodeMeta, SchemaMapping,
    StorageEngineMeta, StorageUnitMeta, UserMeta,
};
