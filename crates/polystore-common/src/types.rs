//! Core type definitions for PolyStore
//!
//! Identifiers for nodes, storage engines and storage units, plus the small
//! enumerations shared by the metadata records.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cluster-wide identifier of a middleware node, allocated at registration
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display, From, Into,
)]
#[display("{_0}")]
pub struct NodeId(u64);

impl NodeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of a backing storage engine
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display, From, Into,
)]
#[display("{_0}")]
pub struct StorageEngineId(u64);

impl StorageEngineId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of a storage unit
///
/// Real ids are allocated by the coordination store (`unit0000000001`).
/// Dummy units use `dummy{engine:010}` so every node derives the same id.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct StorageUnitId(String);

impl StorageUnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the storage unit allocated for the `seq`-th real unit
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("unit{seq:010}"))
    }

    /// Id of the dummy storage unit owned by a storage engine
    #[must_use]
    pub fn dummy(engine: StorageEngineId) -> Self {
        Self(format!("dummy{:010}", engine.as_u64()))
    }

    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.0.starts_with("dummy")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StorageUnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of backing storage engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngineKind {
    IoTDB,
    InfluxDB,
    Relational,
    FileSystem,
    Redis,
    MongoDB,
}

impl fmt::Display for StorageEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IoTDB => "iotdb",
            Self::InfluxDB => "influxdb",
            Self::Relational => "relational",
            Self::FileSystem => "filesystem",
            Self::Redis => "redis",
            Self::MongoDB => "mongodb",
        };
        f.write_str(s)
    }
}

impl FromStr for StorageEngineKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iotdb" | "iotdb12" => Ok(Self::IoTDB),
            "influxdb" => Ok(Self::InfluxDB),
            "relational" | "postgresql" | "mysql" => Ok(Self::Relational),
            "filesystem" => Ok(Self::FileSystem),
            "redis" => Ok(Self::Redis),
            "mongodb" => Ok(Self::MongoDB),
            other => Err(crate::Error::invalid_argument(format!(
                "unknown storage engine kind: {other}"
            ))),
        }
    }
}

/// Lifecycle of a storage unit: `Creating -> Normal -> Discard`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageUnitState {
    Creating,
    #[default]
    Normal,
    Discard,
}

/// Cluster-wide resharding status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshardStatus {
    #[default]
    NonResharding,
    Executing,
}

/// Role of a user account
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Administrator,
    #[default]
    OrdinaryUser,
}

/// Permission granted to a user account
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    Admin,
    Cluster,
}

impl Permission {
    /// Every permission, granted to the administrator
    pub const ALL: [Self; 4] = [Self::Read, Self::Write, Self::Admin, Self::Cluster];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_unit_id_formats() {
        assert_eq!(StorageUnitId::from_sequence(1).as_str(), "unit0000000001");
        let dummy = StorageUnitId::dummy(StorageEngineId::new(7));
        assert_eq!(dummy.as_str(), "dummy0000000007");
        assert!(dummy.is_dummy());
        assert!(!StorageUnitId::from_sequence(7).is_dummy());
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!(
            "IoTDB".parse::<StorageEngineKind>().unwrap(),
            StorageEngineKind::IoTDB
        );
        assert_eq!(
            "postgresql".parse::<StorageEngineKind>().unwrap(),
            StorageEngineKind::Relational
        );
        assert!("cassandra".parse::<StorageEngineKind>().is_err());
        assert_eq!(StorageEngineKind::FileSystem.to_string(), "filesystem");
    }

    #[test]
    fn test_node_id_ordering() {
        assert!(NodeId::new(1) < NodeId::new(2));
        assert_eq!(NodeId::from(5u64).as_u64(), 5);
    }
}
