//! PolyStore Placement - where new storage units go
//!
//! This crate picks storage engines for new replication groups and proposes
//! the initial tiling of the columns × key space when a cluster receives its
//! first write.
//!
//! # Example
//! ```ignore
//! use polystore_placement::InitialLayoutPlanner;
//!
//! let plan = InitialLayoutPlanner::new(replica_num)
//!     .plan_initial(&paths, KeyInterval::full(), &engines, &id_gen);
//! manager.create_initial_fragments_and_storage_units(&plan);
//! ```

pub mod layout;
pub mod replica;

pub use layout::{FragmentPlan, InitialLayoutPlanner, LayoutPlan, ReplicaPlan, StorageUnitPlan};
pub use replica::{round_robin, select_replica_set};
