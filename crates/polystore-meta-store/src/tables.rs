//! Redb table definitions for the coordination store.
//!
//! Every table maps a string key to a bincode (or little-endian counter)
//! encoded value, so change notifications can carry raw bytes.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

// Topology
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
pub const STORAGE_ENGINES: TableDefinition<&str, &[u8]> = TableDefinition::new("storage_engines");
pub const STORAGE_UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("storage_units");
// Key: "{start}\x01{end}\x01{start_key:020}", see `records::fragment_key`
pub const FRAGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("fragments");

// Catalog
pub const SCHEMA_MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_mappings");
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

// Statistics, keyed like FRAGMENTS
pub const FRAGMENT_REQUESTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("fragment_requests");
pub const FRAGMENT_HEAT: TableDefinition<&str, &[u8]> = TableDefinition::new("fragment_heat");
pub const FRAGMENT_POINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("fragment_points");

// Coordination
pub const COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("counters");
pub const RESHARD_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("reshard_status");
pub const STATISTICS: TableDefinition<&str, &[u8]> = TableDefinition::new("statistics");
// Key: storage engine id
pub const MIGRATION_PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("migration_plans");

/// Logical record class of the coordination store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Nodes,
    StorageEngines,
    StorageUnits,
    Fragments,
    SchemaMappings,
    Users,
    FragmentRequests,
    FragmentHeat,
    FragmentPoints,
    Counters,
    ReshardStatus,
    Statistics,
    MigrationPlans,
}

impl Table {
    pub const ALL: [Self; 13] = [
        Self::Nodes,
        Self::StorageEngines,
        Self::StorageUnits,
        Self::Fragments,
        Self::SchemaMappings,
        Self::Users,
        Self::FragmentRequests,
        Self::FragmentHeat,
        Self::FragmentPoints,
        Self::Counters,
        Self::ReshardStatus,
        Self::Statistics,
        Self::MigrationPlans,
    ];

    #[must_use]
    pub const fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Nodes => NODES,
            Self::StorageEngines => STORAGE_ENGINES,
            Self::StorageUnits => STORAGE_UNITS,
            Self::Fragments => FRAGMENTS,
            Self::SchemaMappings => SCHEMA_MAPPINGS,
            Self::Users => USERS,
            Self::FragmentRequests => FRAGMENT_REQUESTS,
            Self::FragmentHeat => FRAGMENT_HEAT,
            Self::FragmentPoints => FRAGMENT_POINTS,
            Self::Counters => COUNTERS,
            Self::ReshardStatus => RESHARD_STATUS,
            Self::Statistics => STATISTICS,
            Self::MigrationPlans => MIGRATION_PLANS,
        }
    }
}
