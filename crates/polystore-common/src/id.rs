//! Process-local unique id generator
//!
//! Ids are a time + node + sequence composite: 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of node id and a 12 bit per-millisecond sequence.

use crate::NodeId;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// 2024-01-01T00:00:00Z
pub const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Generator of unique ids seeded with the registered node id
#[derive(Debug)]
pub struct IdGenerator {
    node: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node: node.as_u64() & NODE_MASK,
            state: Mutex::new(State::default()),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .saturating_sub(EPOCH_MS)
    }

    /// Next id; strictly increasing within this generator
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = Self::now_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // sequence exhausted for this millisecond, borrow the next one
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        (now << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | state.sequence
    }

    /// Next id rendered with a textual prefix, e.g. `fake-123`
    pub fn next_named(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_increasing() {
        let id_gen = IdGenerator::new(NodeId::new(3));
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = id_gen.next_id();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_node_bits_embedded() {
        let id = IdGenerator::new(NodeId::new(5)).next_id();
        assert_eq!((id >> SEQUENCE_BITS) & NODE_MASK, 5);
    }

    #[test]
    fn test_named_ids_differ_across_nodes() {
        let a = IdGenerator::new(NodeId::new(1));
        let b = IdGenerator::new(NodeId::new(2));
        assert_ne!(a.next_named("fake"), b.next_named("fake"));
    }
}
