//! Named leased locks.
//!
//! A lock is held by a node for at most one lease. An acquirer blocks until
//! the holder releases it or the lease expires; an expired lease is taken
//! over. Releasing is tied to [`LockGuard`] being dropped.

use crate::store::{MetaStoreError, MetaStoreResult};
use parking_lot::{Condvar, Mutex};
use polystore_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Resource class guarded by a named lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockResource {
    Fragment,
    StorageUnit,
    StorageEngine,
    ReshardStatus,
    ReshardCounter,
    MaxActiveEndKeyStatistics,
    FragmentRequestsCounter,
    FragmentHeatCounter,
    MigrationPlan,
}

impl LockResource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fragment => "fragment",
            Self::StorageUnit => "storage_unit",
            Self::StorageEngine => "storage_engine",
            Self::ReshardStatus => "reshard_status",
            Self::ReshardCounter => "reshard_counter",
            Self::MaxActiveEndKeyStatistics => "max_active_end_key_statistics",
            Self::FragmentRequestsCounter => "fragment_requests_counter",
            Self::FragmentHeatCounter => "fragment_heat_counter",
            Self::MigrationPlan => "migration_plan",
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Releases a held lock when dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    resource: LockResource,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LockGuard {
    pub fn new(resource: LockResource, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            resource,
            release: Some(Box::new(release)),
        }
    }

    #[must_use]
    pub const fn resource(&self) -> LockResource {
        self.resource
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Debug)]
struct Lease {
    holder: NodeId,
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseState {
    leases: HashMap<LockResource, Lease>,
    next_token: u64,
}

/// In-process lease table shared by every handle of one store
#[derive(Debug)]
pub struct LeaseTable {
    state: Mutex<LeaseState>,
    released: Condvar,
    lease: Duration,
    wait: Duration,
}

impl LeaseTable {
    #[must_use]
    pub fn new(lease: Duration, wait: Duration) -> Self {
        Self {
            state: Mutex::new(LeaseState::default()),
            released: Condvar::new(),
            lease,
            wait,
        }
    }

    /// Block until `resource` is free (or its lease expired), then take it
    pub fn acquire(self: &Arc<Self>, resource: LockResource, holder: NodeId) -> MetaStoreResult<LockGuard> {
        let deadline = Instant::now() + self.wait;
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let wake_at = match state.leases.get(&resource) {
                None => break,
                Some(lease) if lease.expires_at <= now => {
                    warn!(
                        "Lease on {} held by node {} expired, taking over for node {}",
                        resource, lease.holder, holder
                    );
                    break;
                }
                Some(lease) => lease.expires_at.min(deadline),
            };
            if now >= deadline {
                return Err(MetaStoreError::LockTimeout {
                    resource: resource.to_string(),
                });
            }
            self.released.wait_until(&mut state, wake_at);
        }

        state.next_token += 1;
        let token = state.next_token;
        state.leases.insert(
            resource,
            Lease {
                holder,
                token,
                expires_at: Instant::now() + self.lease,
            },
        );
        drop(state);
        debug!("Node {} acquired lock {}", holder, resource);

        let table = Arc::clone(self);
        Ok(LockGuard::new(resource, move || table.release(resource, token)))
    }

    fn release(&self, resource: LockResource, token: u64) {
        let mut state = self.state.lock();
        // a lease taken over after expiry belongs to the new holder
        if state.leases.get(&resource).is_some_and(|l| l.token == token) {
            state.leases.remove(&resource);
        }
        drop(state);
        self.released.notify_all();
    }

    /// Whether `resource` is currently held by a live lease
    #[must_use]
    pub fn is_held(&self, resource: LockResource) -> bool {
        self.state
            .lock()
            .leases
            .get(&resource)
            .is_some_and(|l| l.expires_at > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn table(lease_ms: u64, wait_ms: u64) -> Arc<LeaseTable> {
        Arc::new(LeaseTable::new(
            Duration::from_millis(lease_ms),
            Duration::from_millis(wait_ms),
        ))
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let leases = table(30_000, 1_000);
        let guard = leases.acquire(LockResource::Fragment, NodeId::new(1)).unwrap();
        assert!(leases.is_held(LockResource::Fragment));
        assert!(!leases.is_held(LockResource::StorageUnit));
        drop(guard);
        assert!(!leases.is_held(LockResource::Fragment));
    }

    #[test]
    fn test_mutual_exclusion() {
        let leases = table(30_000, 10_000);
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let leases = Arc::clone(&leases);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = leases
                            .acquire(LockResource::StorageUnit, NodeId::new(i))
                            .unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wait_times_out() {
        let leases = table(30_000, 50);
        let _held = leases.acquire(LockResource::ReshardStatus, NodeId::new(1)).unwrap();
        let err = leases
            .acquire(LockResource::ReshardStatus, NodeId::new(2))
            .unwrap_err();
        assert!(matches!(err, MetaStoreError::LockTimeout { .. }));
    }

    #[test]
    fn test_expired_lease_taken_over() {
        let leases = table(200, 5_000);
        let stale = leases.acquire(LockResource::Fragment, NodeId::new(1)).unwrap();
        let fresh = leases.acquire(LockResource::Fragment, NodeId::new(2)).unwrap();
        // the stale holder must not release the new lease
        drop(stale);
        assert!(leases.is_held(LockResource::Fragment));
        drop(fresh);
        assert!(!leases.is_held(LockResource::Fragment));
    }
}
