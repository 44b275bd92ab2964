//! Vector clocks for cross-replica causality.
//!
//! Cross-producer event ordering is partial; domains that need causality
//! (session updates) carry one of these and merge last-writer-wins when
//! clocks are concurrent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::ReplicaId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
    Equal,
    Before,
    After,
    Concurrent,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, replica: ReplicaId) {
        let counter = self.counters.entry(replica).or_insert(0);
        *counter += 1;
    }

    /// Pointwise max of both clocks.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &count) in &other.counters {
            let entry = self.counters.entry(*replica).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        let replicas: Vec<_> = self
            .counters
            .keys()
            .chain(other.counters.keys())
            .collect();
        for replica in replicas {
            let a = self.get(replica);
            let b = other.get(replica);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(b: u8) -> ReplicaId {
        ReplicaId::new(Uuid::from_bytes([b; 16]))
    }

    #[test]
    fn increment_orders_causally() {
        let mut a = VectorClock::new();
        let b = a.clone();
        a.increment(replica(1));

        assert_eq!(a.compare(&b), Causality::After);
        assert_eq!(b.compare(&a), Causality::Before);
    }

    #[test]
    fn independent_updates_are_concurrent() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(replica(1));
        b.increment(replica(2));

        assert_eq!(a.compare(&b), Causality::Concurrent);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment(replica(1));
        b.increment(replica(1));
        b.increment(replica(1));
        b.increment(replica(2));

        a.merge(&b);
        assert_eq!(a.get(&replica(1)), 2);
        assert_eq!(a.get(&replica(2)), 1);
        assert_eq!(a.compare(&b), Causality::Equal);
    }
}
