//! Configuration types for PolyStore
//!
//! Sources are merged in order: type defaults, the TOML file, then
//! `POLYSTORE__`-prefixed environment variables
//! (e.g. `POLYSTORE__CLUSTER__REPLICA_NUM=2`).

use crate::{Error, Result, StorageEngineKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration for a PolyStore node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Coordination store
    pub meta: MetaConfig,
    /// Cluster-wide placement settings
    pub cluster: ClusterConfig,
    /// Local metadata cache
    pub cache: CacheConfig,
    /// Storage engines registered when the cluster has none yet
    pub storage_engines: Vec<StorageEngineConfig>,
    /// Administrator account seeded into an empty user table
    pub admin: AdminConfig,
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("POLYSTORE")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );
        let config: Self = builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.meta.lock_lease_ms == 0 {
            return Err(Error::Configuration("meta.lock_lease_ms must be > 0".into()));
        }
        if self.meta.watch_capacity == 0 {
            return Err(Error::Configuration("meta.watch_capacity must be > 0".into()));
        }
        if self.cache.enable_fragment_cache_control && self.cache.fragment_cache_threshold_kb == 0 {
            return Err(Error::Configuration(
                "cache.fragment_cache_threshold_kb must be > 0 when cache control is enabled"
                    .into(),
            ));
        }
        for engine in &self.storage_engines {
            engine.kind.parse::<StorageEngineKind>()?;
        }
        Ok(())
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address other components use to reach this node
    pub ip: String,
    /// Client-facing port
    pub port: u16,
    /// Data directory for the file-backed coordination store
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 6888,
            data_dir: PathBuf::from("/var/lib/polystore"),
        }
    }
}

/// Coordination store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Keep the store in memory (single process clusters and tests)
    pub in_memory: bool,
    /// Store file; defaults to `<data_dir>/meta.redb`
    pub path: Option<PathBuf>,
    /// Lease of a named lock before another node may take it over
    pub lock_lease_ms: u64,
    /// How long an acquirer waits before giving up
    pub lock_wait_ms: u64,
    /// Buffered change notifications per subscriber
    pub watch_capacity: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            path: None,
            lock_lease_ms: 30_000,
            lock_wait_ms: 60_000,
            watch_capacity: 4096,
        }
    }
}

impl MetaConfig {
    /// Resolved store file for a node
    #[must_use]
    pub fn store_path(&self, node: &NodeConfig) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| node.data_dir.join("meta.redb"))
    }
}

/// Cluster-wide placement configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Replicas per storage unit in addition to the master
    pub replica_num: usize,
    /// Margin added to the max active end key, in seconds
    pub reshard_key_margin_secs: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replica_num: 0,
            reshard_key_margin_secs: 10,
        }
    }
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound the number of cached fragments and fall back to the store
    pub enable_fragment_cache_control: bool,
    /// Memory budget of cached fragments in KiB
    pub fragment_cache_threshold_kb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_fragment_cache_control: false,
            fragment_cache_threshold_kb: 131_072,
        }
    }
}

/// A storage engine declared in the configuration file
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageEngineConfig {
    pub ip: String,
    pub port: u16,
    /// Engine kind, e.g. `iotdb`, `influxdb`, `relational`
    pub kind: String,
    pub read_only: bool,
    /// Engine already holds data not written through PolyStore
    pub has_data: bool,
    /// Column prefix of the pre-existing data
    pub data_prefix: Option<String>,
    /// Prefix prepended to column paths of the pre-existing data
    pub schema_prefix: Option<String>,
    /// Key range of the pre-existing data, `[start, end)`
    pub dummy_key_start: Option<i64>,
    pub dummy_key_end: Option<i64>,
    /// Engine-specific parameters passed through untouched
    pub extra_params: BTreeMap<String, String>,
}

impl Default for StorageEngineConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 6667,
            kind: "iotdb".to_string(),
            read_only: false,
            has_data: false,
            data_prefix: None,
            schema_prefix: None,
            dummy_key_start: None,
            dummy_key_end: None,
            extra_params: BTreeMap::new(),
        }
    }
}

/// Seed administrator account
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: "root".to_string(),
        }
    }
}
