//! Hybrid write stamps for last-write-wins resolution.
//!
//! A [`Stamp`] combines wall-clock milliseconds with the writing replica's
//! id. Comparing stamps compares the wall clock first and falls back to the
//! replica id, so two concurrent writes to the same key always have a
//! deterministic winner regardless of which replica merges them first.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::crdt::types::replica::ReplicaId;

/// Hybrid (wall clock, replica) write stamp used by the LWW family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Milliseconds since the Unix epoch at write time.
    pub millis: i64,
    /// The replica that produced the write, used as tie-break.
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(millis: i64, replica: ReplicaId) -> Self {
        Stamp { millis, replica }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.millis.cmp(&other.millis) {
            Ordering::Equal => self.replica.cmp(&other.replica),
            other => other,
        }
    }
}

/// A thread-safe stamp source that never runs backwards.
///
/// Each issued stamp is at least one millisecond past the previously issued
/// one, even if the wall clock stalls or steps back, so local writes from
/// one replica are always ordered by their stamps.
pub struct HybridClock {
    replica: ReplicaId,
    last_millis: AtomicI64,
}

impl HybridClock {
    pub fn new(replica: ReplicaId) -> Self {
        HybridClock {
            replica,
            last_millis: AtomicI64::new(0),
        }
    }

    /// Issues the next stamp for this replica.
    pub fn now(&self) -> Stamp {
        let wall = Utc::now().timestamp_millis();
        let mut last = self.last_millis.load(AtomicOrdering::SeqCst);
        loop {
            let next = wall.max(last + 1);
            match self.last_millis.compare_exchange_weak(
                last,
                next,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return Stamp::new(next, self.replica),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_ordering() {
        let s1 = Stamp::new(100, 1);
        let s2 = Stamp::new(100, 2);
        let s3 = Stamp::new(101, 1);

        // Same wall clock, replica breaks the tie
        assert!(s1 < s2);
        // Later wall clock wins over higher replica
        assert!(s2 < s3);
    }

    #[test]
    fn test_hybrid_clock_is_monotonic() {
        let clock = HybridClock::new(9);
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.replica, 9);
    }
}
