//! Observers of storage-unit and storage-engine topology changes.
//!
//! Hooks run synchronously on the thread that applied the change: the
//! mutating call for local writes, the watch task for remote ones.

use parking_lot::RwLock;
use polystore_meta_store::{StorageEngineMeta, StorageUnitMeta};
use std::sync::Arc;

/// Called with the unit before the change (if it existed) and after it
pub type StorageUnitHook = Arc<dyn Fn(Option<&StorageUnitMeta>, &StorageUnitMeta) + Send + Sync>;

/// Called with the engine before and after; `None` after means removal
pub type StorageEngineHook =
    Arc<dyn Fn(Option<&StorageEngineMeta>, Option<&StorageEngineMeta>) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    storage_unit: RwLock<Vec<StorageUnitHook>>,
    storage_engine: RwLock<Vec<StorageEngineHook>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_storage_unit_hook(&self, hook: StorageUnitHook) {
        self.storage_unit.write().push(hook);
    }

    pub fn register_storage_engine_hook(&self, hook: StorageEngineHook) {
        self.storage_engine.write().push(hook);
    }

    pub fn notify_storage_unit(&self, before: Option<&StorageUnitMeta>, after: &StorageUnitMeta) {
        let hooks = self.storage_unit.read().clone();
        for hook in hooks {
            hook(before, after);
        }
    }

    pub fn notify_storage_engine(
        &self,
        before: Option<&StorageEngineMeta>,
        after: Option<&StorageEngineMeta>,
    ) {
        let hooks = self.storage_engine.read().clone();
        for hook in hooks {
            hook(before, after);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_common::{NodeId, StorageEngineId, StorageUnitId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_receive_before_and_after() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        registry.register_storage_unit_hook(Arc::new(
            move |before: Option<&StorageUnitMeta>, after: &StorageUnitMeta| {
                assert!(before.is_none());
                assert_eq!(after.id.as_str(), "unit0000000001");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let unit = StorageUnitMeta::master(
            StorageUnitId::from_sequence(1),
            StorageEngineId::new(1),
            NodeId::new(1),
        );
        registry.notify_storage_unit(None, &unit);
        registry.notify_storage_unit(None, &unit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hook_may_register_another_hook() {
        let registry = Arc::new(HookRegistry::new());
        let inner = Arc::clone(&registry);
        let noop: StorageEngineHook = Arc::new(
            |_: Option<&StorageEngineMeta>, _: Option<&StorageEngineMeta>| {},
        );
        registry.register_storage_engine_hook(Arc::new(
            move |_: Option<&StorageEngineMeta>, _: Option<&StorageEngineMeta>| {
                inner.register_storage_engine_hook(Arc::clone(&noop));
            },
        ));
        registry.notify_storage_engine(None, None);
        assert_eq!(registry.storage_engine.read().len(), 2);
    }
}
