//! Cluster-wide reshard barrier.
//!
//! The proposer flips the shared status to EXECUTING. Every node that
//! observes the flip, the proposer included, publishes its max active end
//! key and increments the shared counter. Once the counter reaches the
//! number of other live nodes the proposer resets it and flips the status
//! back; every node then clears its proposer flag.
//!
//! Lock order: reshard counter before reshard status.

use super::MetaManager;
use polystore_common::{ReshardStatus, Result};
use polystore_meta_store::LockResource;
use polystore_meta_store::records::keys;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

impl MetaManager {
    #[must_use]
    pub fn reshard_status(&self) -> ReshardStatus {
        *self.reshard_status.read()
    }

    #[must_use]
    pub fn is_proposer(&self) -> bool {
        self.is_proposer.load(Ordering::SeqCst)
    }

    /// Propose a reshard; false if one is already running or on failure
    pub fn begin_reshard(&self) -> bool {
        self.run("begin reshard", || {
            let _status_lock = self.records.lock(LockResource::ReshardStatus, self.node.id)?;
            if self.records.reshard_status()? == ReshardStatus::Executing {
                info!("Reshard already in progress, node {} will not propose", self.node.id);
                return Ok(false);
            }
            self.is_proposer.store(true, Ordering::SeqCst);
            self.reshard_acked.store(false, Ordering::SeqCst);
            if let Err(e) = self.records.put_reshard_status(ReshardStatus::Executing) {
                self.is_proposer.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            *self.reshard_status.write() = ReshardStatus::Executing;
            info!("Node {} proposed a reshard", self.node.id);
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Publish this node's max active end key and count it in the barrier
    ///
    /// Returns false when no reshard is running any more.
    pub fn ack_reshard(&self) -> bool {
        self.run("acknowledge reshard", || {
            {
                let _stats_lock = self
                    .records
                    .lock(LockResource::MaxActiveEndKeyStatistics, self.node.id)?;
                self.records
                    .merge_max_active_end_key(self.max_active_end_key.load(Ordering::SeqCst))?;
            }
            let _counter_lock = self.records.lock(LockResource::ReshardCounter, self.node.id)?;
            if self.records.reshard_status()? != ReshardStatus::Executing {
                debug!("Reshard finished before node {} acknowledged", self.node.id);
                return Ok(false);
            }
            let counter = self.records.increment_counter(keys::RESHARD_COUNTER, 1)?;
            self.reshard_acked.store(true, Ordering::SeqCst);
            debug!("Node {} acknowledged reshard, counter {}", self.node.id, counter);
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Shared reshard counter value
    #[must_use]
    pub fn reshard_counter(&self) -> i64 {
        self.run("read reshard counter", || {
            Ok(self.records.counter(keys::RESHARD_COUNTER)?)
        })
        .unwrap_or(0)
    }

    pub(super) fn on_reshard_status(&self, status: ReshardStatus) {
        *self.reshard_status.write() = status;
        match status {
            ReshardStatus::Executing => {
                if !self.reshard_acked.load(Ordering::SeqCst) {
                    self.ack_reshard();
                }
            }
            ReshardStatus::NonResharding => {
                self.reshard_acked.store(false, Ordering::SeqCst);
                if self.is_proposer.swap(false, Ordering::SeqCst) {
                    info!("Node {} (proposer) finished resharding", self.node.id);
                } else {
                    info!("Node {} finished resharding", self.node.id);
                }
            }
        }
    }

    /// Catch up on reshard transitions missed while the watch lagged
    pub(super) fn resync_reshard(&self) -> Result<()> {
        let status = self.records.reshard_status()?;
        match status {
            ReshardStatus::Executing => {
                self.on_reshard_status(status);
                self.on_reshard_counter(self.records.counter(keys::RESHARD_COUNTER)?);
            }
            ReshardStatus::NonResharding => {
                if self.reshard_status() == ReshardStatus::Executing || self.is_proposer() {
                    self.on_reshard_status(status);
                }
            }
        }
        Ok(())
    }

    /// Proposer side of the barrier
    pub(super) fn on_reshard_counter(&self, counter: i64) {
        if counter <= 0 || !self.is_proposer() {
            return;
        }
        let others = i64::try_from(self.cache.node_count().saturating_sub(1)).unwrap_or(i64::MAX);
        if counter < others {
            debug!("Reshard acknowledged by {} of {} nodes", counter, others);
            return;
        }
        self.run("finish reshard", || {
            let _counter_lock = self.records.lock(LockResource::ReshardCounter, self.node.id)?;
            let _status_lock = self.records.lock(LockResource::ReshardStatus, self.node.id)?;
            self.records.reset_counter(keys::RESHARD_COUNTER)?;
            if self.records.reshard_status()? == ReshardStatus::Executing {
                self.records.put_reshard_status(ReshardStatus::NonResharding)?;
                info!("All {} other nodes acknowledged the reshard", others);
            }
            Ok(())
        });
    }

    // ---- Max active end key ----

    /// Raise the local max active end key to `end_key` plus the margin
    pub fn update_max_active_end_key(&self, end_key: i64) {
        let margin = self
            .config
            .cluster
            .reshard_key_margin_secs
            .saturating_mul(1000);
        self.max_active_end_key
            .fetch_max(end_key.saturating_add(margin), Ordering::SeqCst);
    }

    #[must_use]
    pub fn max_active_end_key(&self) -> i64 {
        self.max_active_end_key.load(Ordering::SeqCst)
    }

    /// Merge the local max active end key into the shared statistics
    pub fn submit_max_active_end_key(&self) -> bool {
        self.run("submit max active end key", || {
            let _stats_lock = self
                .records
                .lock(LockResource::MaxActiveEndKeyStatistics, self.node.id)?;
            self.records
                .merge_max_active_end_key(self.max_active_end_key.load(Ordering::SeqCst))?;
            Ok(())
        })
        .is_some()
    }

    pub(super) fn on_max_active_end_key(&self, end_key: i64) {
        self.max_active_end_key.fetch_max(end_key, Ordering::SeqCst);
    }
}
