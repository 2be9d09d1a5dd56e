//! Shared per-fragment request, heat and point statistics.

use super::MetaManager;
use polystore_common::ColumnsRange;
use polystore_meta_store::records::keys;
use polystore_meta_store::{FragmentLoad, FragmentMeta, LockResource, Table};
use tracing::info;

type FragmentKey = (ColumnsRange, i64);

impl MetaManager {
    fn accumulate(
        &self,
        operation: &str,
        lock: LockResource,
        table: Table,
        counter: &str,
        loads: &[(FragmentMeta, FragmentLoad)],
    ) -> bool {
        self.run(operation, || {
            let _counter_lock = self.records.lock(lock, self.node.id)?;
            self.records.accumulate_fragment_load(table, loads)?;
            self.records.increment_counter(counter, 1)?;
            Ok(())
        })
        .is_some()
    }

    /// Add request counts and count this node's submission
    pub fn update_fragment_requests(&self, loads: &[(FragmentMeta, FragmentLoad)]) -> bool {
        self.accumulate(
            "update fragment requests",
            LockResource::FragmentRequestsCounter,
            Table::FragmentRequests,
            keys::FRAGMENT_REQUESTS_COUNTER,
            loads,
        )
    }

    /// Drain the local monitor into the shared request statistics
    pub fn submit_fragment_requests(&self) -> bool {
        let loads = self.monitor.drain();
        self.update_fragment_requests(&loads)
    }

    pub fn update_fragment_heat(&self, loads: &[(FragmentMeta, FragmentLoad)]) -> bool {
        self.accumulate(
            "update fragment heat",
            LockResource::FragmentHeatCounter,
            Table::FragmentHeat,
            keys::FRAGMENT_HEAT_COUNTER,
            loads,
        )
    }

    #[must_use]
    pub fn load_fragment_requests(&self) -> Vec<(FragmentKey, FragmentLoad)> {
        self.run("load fragment requests", || {
            Ok(self.records.load_fragment_loads(Table::FragmentRequests)?)
        })
        .unwrap_or_default()
    }

    #[must_use]
    pub fn load_fragment_heat(&self) -> Vec<(FragmentKey, FragmentLoad)> {
        self.run("load fragment heat", || {
            Ok(self.records.load_fragment_loads(Table::FragmentHeat)?)
        })
        .unwrap_or_default()
    }

    /// Number of submissions since the counters were last cleared
    #[must_use]
    pub fn fragment_requests_counter(&self) -> i64 {
        self.run("read fragment requests counter", || {
            Ok(self.records.counter(keys::FRAGMENT_REQUESTS_COUNTER)?)
        })
        .unwrap_or(0)
    }

    #[must_use]
    pub fn fragment_heat_counter(&self) -> i64 {
        self.run("read fragment heat counter", || {
            Ok(self.records.counter(keys::FRAGMENT_HEAT_COUNTER)?)
        })
        .unwrap_or(0)
    }

    /// Record how many points a fragment holds
    pub fn update_fragment_points(&self, fragment: &FragmentMeta, points: i64) -> bool {
        self.run("update fragment points", || {
            self.records
                .put_fragment_points(&[(fragment.clone(), points)])?;
            Ok(())
        })
        .is_some()
    }

    #[must_use]
    pub fn load_fragment_points(&self) -> Vec<(FragmentKey, i64)> {
        self.run("load fragment points", || Ok(self.records.load_fragment_points()?))
            .unwrap_or_default()
    }

    /// Reset the shared statistics and the local monitor
    ///
    /// Only the node with the lowest id touches the shared records.
    pub fn clear_monitoring_counters(&self) -> bool {
        self.monitor.clear();
        let lowest = self.cache.nodes().iter().map(|n| n.id).min();
        if lowest != Some(self.node.id) {
            return true;
        }
        self.run("clear monitoring counters", || {
            let _requests_lock = self
                .records
                .lock(LockResource::FragmentRequestsCounter, self.node.id)?;
            let _heat_lock = self
                .records
                .lock(LockResource::FragmentHeatCounter, self.node.id)?;
            self.records.reset_counter(keys::FRAGMENT_REQUESTS_COUNTER)?;
            self.records.reset_counter(keys::FRAGMENT_HEAT_COUNTER)?;
            self.records.clear_table(Table::FragmentRequests)?;
            self.records.clear_table(Table::FragmentHeat)?;
            self.records.clear_table(Table::FragmentPoints)?;
            info!("Node {} cleared the shared monitoring counters", self.node.id);
            Ok(())
        })
        .is_some()
    }
}
