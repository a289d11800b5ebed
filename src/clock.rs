//! Vector clocks over per-instance sequence numbers.
//!
//! A [`VectorClock`] maps an [`InstanceId`] to the highest *contiguous*
//! sequence number from that instance which has been absorbed into some
//! state (a snapshot, a working composition, a GC retention boundary).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::InstanceId;

/// `InstanceId -> highest contiguous sequence absorbed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<InstanceId, u64>);

impl VectorClock {
    /// An empty clock (as if no snapshot existed yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest contiguous sequence known for `instance`, or `None` if
    /// the clock has never seen that instance.
    pub fn get(&self, instance: &InstanceId) -> Option<u64> {
        self.0.get(instance).copied()
    }

    /// Set the highest contiguous sequence for `instance`. Callers must
    /// ensure they only ever advance (never regress) a given instance's
    /// entry; this type does not enforce monotonicity itself because GC
    /// computations legitimately build fresh clocks from scratch.
    pub fn set(&mut self, instance: InstanceId, seq: u64) {
        self.0.insert(instance, seq);
    }

    /// Advance `instance`'s entry to `seq` only if `seq` is higher than
    /// what's currently recorded (or nothing is recorded yet).
    pub fn advance(&mut self, instance: InstanceId, seq: u64) {
        let slot = self.0.entry(instance).or_insert(seq);
        if seq > *slot {
            *slot = seq;
        }
    }

    /// Pointwise maximum of two clocks (used when merging clocks derived
    /// from independently-scanned packs/updates).
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.0.clone();
        for (instance, seq) in &other.0 {
            let slot = out.entry(instance.clone()).or_insert(0);
            if *seq > *slot {
                *slot = *seq;
            }
        }
        VectorClock(out)
    }

    /// `true` if `self` absorbs everything `other` does, i.e. for every
    /// instance in `other`, `self`'s entry is >= `other`'s entry. Used by
    /// the "snapshot dominance" invariant to decide whether
    /// a file is safe to delete.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .0
            .iter()
            .all(|(instance, seq)| self.get(instance).unwrap_or(0) >= *seq)
    }

    /// Sum of all per-instance sequences, i.e. `totalChanges` in a
    /// snapshot filename.
    pub fn total_changes(&self) -> u64 {
        self.0.values().sum()
    }

    /// Iterate over `(instance, seq)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, u64)> + '_ {
        self.0.iter().map(|(k, v)| (k.clone(), *v))
    }

    /// Number of instances tracked.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if no instance has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a clock from an iterator of `(instance, seq)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (InstanceId, u64)>) -> Self {
        Self(pairs.into_iter().collect())
    }
}
