//! Causal version tracking with exact per-replica coverage.
//!
//! A [`VectorClock`] records, per replica, exactly which operation counters
//! have been seen, as sorted inclusive ranges. A single high-water counter
//! per replica is not enough here: replicas issue ids from a Lamport clock
//! that jumps forward whenever a remote id is observed, so one replica's
//! counters legitimately gap. Seeing counter 6 from a replica says nothing
//! about counter 1. Merging two clocks takes the pointwise union, which is
//! commutative, associative and idempotent, the same algebra the rest of
//! the engine depends on.

use std::collections::BTreeMap;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::crdt::types::op_id::OpId;
use crate::crdt::types::replica::ReplicaId;

/// Sorted, disjoint, inclusive counter ranges seen from one replica.
///
/// Adjacent ranges coalesce on insert, so a replica whose counters arrive
/// without gaps collapses to a single range. On the wire this is a list of
/// `[start, end]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct SeenRanges(Vec<(u64, u64)>);

impl SeenRanges {
    fn locate(&self, counter: u64) -> Result<usize, usize> {
        self.0.binary_search_by(|&(start, end)| {
            if counter < start {
                Ordering::Greater
            } else if counter > end {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
    }

    fn contains(&self, counter: u64) -> bool {
        self.locate(counter).is_ok()
    }

    fn insert(&mut self, counter: u64) {
        let idx = match self.locate(counter) {
            Ok(_) => return,
            Err(idx) => idx,
        };
        // locate() guarantees the left neighbor ends below `counter` and
        // the right neighbor starts above it, so these subtractions hold.
        let joins_left = idx > 0 && self.0[idx - 1].1 == counter - 1;
        let joins_right = idx < self.0.len() && self.0[idx].0 - 1 == counter;
        match (joins_left, joins_right) {
            (true, true) => {
                self.0[idx - 1].1 = self.0[idx].1;
                self.0.remove(idx);
            }
            (true, false) => self.0[idx - 1].1 = counter,
            (false, true) => self.0[idx].0 = counter,
            (false, false) => self.0.insert(idx, (counter, counter)),
        }
    }

    fn max(&self) -> u64 {
        self.0.last().map(|&(_, end)| end).unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn union(&self, other: &SeenRanges) -> SeenRanges {
        let mut all: Vec<(u64, u64)> = self.0.iter().chain(other.0.iter()).copied().collect();
        all.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(all.len());
        for (start, end) in all {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        SeenRanges(merged)
    }

    fn intersection(&self, other: &SeenRanges) -> SeenRanges {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            let (a_start, a_end) = self.0[i];
            let (b_start, b_end) = other.0[j];
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if start <= end {
                out.push((start, end));
            }
            if a_end <= b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        SeenRanges(out)
    }

    fn is_superset(&self, other: &SeenRanges) -> bool {
        let mut i = 0;
        'ranges: for &(start, end) in &other.0 {
            while i < self.0.len() {
                let (own_start, own_end) = self.0[i];
                if own_end < start {
                    i += 1;
                    continue;
                }
                if own_start <= start && end <= own_end {
                    continue 'ranges;
                }
                return false;
            }
            return false;
        }
        true
    }
}

/// Exact per-replica causal coverage.
///
/// Coverage is monotonically non-decreasing; there is no way to unsee an
/// operation through the public API. Pruned log history stays covered, so
/// a pruned operation re-delivered later still reads as a duplicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, SeenRanges>,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock::default()
    }

    /// Highest counter seen from `replica`, zero if never seen. Counters
    /// below it may still be unseen; use [`contains`](Self::contains) for
    /// membership.
    pub fn seen(&self, replica: ReplicaId) -> u64 {
        self.entries.get(&replica).map(SeenRanges::max).unwrap_or(0)
    }

    /// Records an observed operation id.
    pub fn record(&mut self, id: OpId) {
        self.entries.entry(id.replica).or_default().insert(id.counter);
    }

    /// Whether the operation identified by `id` has been seen. Exact: a
    /// higher counter seen from the same replica does not imply this one,
    /// since issued counters gap.
    pub fn contains(&self, id: OpId) -> bool {
        self.entries
            .get(&id.replica)
            .is_some_and(|ranges| ranges.contains(id.counter))
    }

    /// Whether an operation's causal prerequisite is already reflected.
    ///
    /// Out-of-order arrival is the expected steady state: a `false` answer
    /// means "buffer and retry later", never an error.
    pub fn satisfies(&self, dependency: Option<OpId>) -> bool {
        dependency.is_none_or(|dep| self.contains(dep))
    }

    /// Pointwise union merge. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&replica, ranges) in &other.entries {
            let entry = self.entries.entry(replica).or_default();
            *entry = entry.union(ranges);
        }
    }

    /// Pointwise intersection: the ids covered by both clocks.
    ///
    /// Used to compute the low-water mark below which log entries are safe
    /// to discard; an id survives only if every intersected clock saw it.
    pub fn intersect(&self, other: &VectorClock) -> VectorClock {
        let mut entries = BTreeMap::new();
        for (&replica, ranges) in &self.entries {
            if let Some(theirs) = other.entries.get(&replica) {
                let common = ranges.intersection(theirs);
                if !common.is_empty() {
                    entries.insert(replica, common);
                }
            }
        }
        VectorClock { entries }
    }

    /// True when every id covered by `other` is covered by this clock.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.entries.iter().all(|(replica, ranges)| {
            self.entries
                .get(replica)
                .is_some_and(|own| own.is_superset(ranges))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-replica high-water counters, for seeding clocks.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.entries.iter().map(|(&r, ranges)| (r, ranges.max()))
    }
}
