//! PolyStore Metadata - cluster topology for middleware nodes
//!
//! The [`MetaManager`] partitions the (columns range × key interval) space
//! into fragments, binds each fragment to a replicated storage unit, and
//! keeps every node's view consistent through the shared coordination
//! store: named locks around each read-modify-write, atomic batches, and a
//! change stream that patches the local [`MetaCache`].
//!
//! ```ignore
//! let manager = MetaManager::new(config, store)?;
//! manager.start_watch();
//! let plan = InitialLayoutPlanner::new(2).plan_initial(&paths, keys, &engines, manager.id_generator());
//! manager.create_initial_fragments_and_storage_units(&plan);
//! ```

pub mod cache;
pub mod hooks;
pub mod manager;
pub mod monitor;
pub mod probe;
pub mod validate;

pub use cache::{MetaCache, StorageUnitChange};
pub use hooks::{HookRegistry, StorageEngineHook, StorageUnitHook};
pub use manager::{BootstrapOutcome, MetaManager};
pub use monitor::RequestMonitor;
pub use probe::{BoundaryProbe, PrefixBoundary};
