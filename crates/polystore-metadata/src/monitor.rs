//! Node-local request counters per fragment.
//!
//! Executors record reads and writes here; the manager periodically
//! drains the counts into the shared statistics tables.

use dashmap::DashMap;
use polystore_meta_store::{FragmentLoad, FragmentMeta};

#[derive(Default)]
pub struct RequestMonitor {
    loads: DashMap<FragmentMeta, FragmentLoad>,
}

impl RequestMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, fragment: &FragmentMeta, points: i64) {
        self.loads.entry(fragment.clone()).or_default().write += points;
    }

    pub fn record_read(&self, fragment: &FragmentMeta, points: i64) {
        self.loads.entry(fragment.clone()).or_default().read += points;
    }

    #[must_use]
    pub fn load(&self, fragment: &FragmentMeta) -> FragmentLoad {
        self.loads.get(fragment).map(|l| *l).unwrap_or_default()
    }

    /// Current counts, sorted by columns range then start key
    #[must_use]
    pub fn snapshot(&self) -> Vec<(FragmentMeta, FragmentLoad)> {
        let mut loads: Vec<_> = self
            .loads
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        loads.sort_by(|(a, _), (b, _)| {
            a.columns
                .cmp(&b.columns)
                .then(a.keys.start().cmp(&b.keys.start()))
        });
        loads
    }

    /// Take the current counts, leaving the monitor empty
    pub fn drain(&self) -> Vec<(FragmentMeta, FragmentLoad)> {
        let keys: Vec<FragmentMeta> = self.loads.iter().map(|e| e.key().clone()).collect();
        let mut loads: Vec<_> = keys
            .iter()
            .filter_map(|fragment| self.loads.remove(fragment))
            .collect();
        loads.sort_by(|(a, _), (b, _)| {
            a.columns
                .cmp(&b.columns)
                .then(a.keys.start().cmp(&b.keys.start()))
        });
        loads
    }

    pub fn clear(&self) {
        self.loads.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_common::{ColumnsRange, KeyInterval, StorageUnitId};

    #[test]
    fn test_record_and_drain() {
        let monitor = RequestMonitor::new();
        let fragment = FragmentMeta::new(
            ColumnsRange::unbounded(),
            KeyInterval::full(),
            StorageUnitId::from("u1"),
        );
        monitor.record_write(&fragment, 10);
        monitor.record_write(&fragment, 5);
        monitor.record_read(&fragment, 3);
        assert_eq!(monitor.load(&fragment), FragmentLoad { write: 15, read: 3 });

        let drained = monitor.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.write, 15);
        assert!(monitor.is_empty());
    }
}
