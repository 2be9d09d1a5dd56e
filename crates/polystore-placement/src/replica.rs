//! Replica-set selection over writable storage engines

use polystore_common::StorageEngineId;
use rand::Rng;
use rand::seq::SliceRandom;

/// Pick `count` engines for a new replication group
///
/// Returns every candidate when there are not more than `count` of them,
/// otherwise a random subset of size `count`.
pub fn select_replica_set<R: Rng + ?Sized>(
    candidates: &[StorageEngineId],
    count: usize,
    rng: &mut R,
) -> Vec<StorageEngineId> {
    if candidates.len() <= count {
        return candidates.to_vec();
    }
    let mut ids = candidates.to_vec();
    ids.shuffle(rng);
    ids.truncate(count);
    ids
}

/// `count` engines taken round-robin starting at position `index`
#[must_use]
pub fn round_robin(candidates: &[StorageEngineId], index: usize, count: usize) -> Vec<StorageEngineId> {
    if candidates.is_empty() {
        return Vec::new();
    }
    (0..count.min(candidates.len()))
        .map(|i| candidates[(index + i) % candidates.len()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn engines(n: u64) -> Vec<StorageEngineId> {
        (1..=n).map(StorageEngineId::new).collect()
    }

    #[test]
    fn test_small_pool_returns_all() {
        let mut rng = rand::thread_rng();
        assert_eq!(select_replica_set(&engines(2), 3, &mut rng), engines(2));
        assert_eq!(select_replica_set(&engines(3), 3, &mut rng), engines(3));
    }

    #[test]
    fn test_large_pool_returns_distinct_subset() {
        let mut rng = rand::thread_rng();
        let pool = engines(10);
        for _ in 0..50 {
            let picked = select_replica_set(&pool, 3, &mut rng);
            assert_eq!(picked.len(), 3);
            let distinct: HashSet<_> = picked.iter().collect();
            assert_eq!(distinct.len(), 3);
            assert!(picked.iter().all(|id| pool.contains(id)));
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let pool = engines(3);
        assert_eq!(
            round_robin(&pool, 2, 2),
            vec![StorageEngineId::new(3), StorageEngineId::new(1)]
        );
        assert_eq!(round_robin(&pool, 0, 5).len(), 3);
        assert!(round_robin(&[], 0, 2).is_empty());
    }
}
