#![allow(dead_code)]

use polystore_common::config::StorageEngineConfig;
use polystore_common::{ColumnsRange, Config, KeyInterval};
use polystore_meta_store::{CoordinationStore, RedbCoordinationStore, StoreOptions};
use polystore_metadata::MetaManager;
use polystore_placement::{FragmentPlan, LayoutPlan, StorageUnitPlan};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn config(engines: u16, replica_num: usize) -> Config {
    let mut config = Config::default();
    config.meta.in_memory = true;
    config.meta.lock_lease_ms = 5_000;
    config.meta.lock_wait_ms = 10_000;
    config.cluster.replica_num = replica_num;
    config.storage_engines = (0..engines)
        .map(|i| StorageEngineConfig {
            port: 6667 + i,
            ..StorageEngineConfig::default()
        })
        .collect();
    config
}

pub fn store(config: &Config) -> Arc<dyn CoordinationStore> {
    Arc::new(RedbCoordinationStore::in_memory(&StoreOptions::from(&config.meta)).unwrap())
}

/// `n` managers of one cluster sharing a store
pub fn cluster(n: usize, config: &Config) -> Vec<Arc<MetaManager>> {
    let store = store(config);
    (0..n)
        .map(|_| MetaManager::new(config.clone(), Arc::clone(&store)).unwrap())
        .collect()
}

/// One master unit on the first engine holding the whole space
pub fn single_unit_plan(manager: &MetaManager) -> LayoutPlan {
    let engine = manager.storage_engines()[0].id;
    LayoutPlan {
        storage_units: vec![StorageUnitPlan {
            fake_id: "u0".to_string(),
            storage_engine_id: engine,
            replicas: vec![],
        }],
        fragments: vec![FragmentPlan {
            columns: ColumnsRange::unbounded(),
            keys: KeyInterval::full(),
            storage_unit: "u0".to_string(),
        }],
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub async fn settle(managers: &[Arc<MetaManager>]) {
    for manager in managers {
        assert!(manager.wait_for_watch(Duration::from_secs(5)).await);
    }
}
