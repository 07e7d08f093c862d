//! Thread-safe Lamport clock for issuing operation identifiers.
//!
//! The clock hands out strictly increasing counters for local operations and
//! is advanced past every remote counter it observes, which preserves the
//! causality property the sequence CRDT relies on: an operation created
//! after observing another always has the greater [`OpId`].

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::crdt::types::op_id::OpId;
use crate::crdt::types::replica::ReplicaId;

/// A thread-safe Lamport clock bound to one replica.
pub struct LamportClock {
    counter: AtomicU64,
    replica: ReplicaId,
}

impl LamportClock {
    pub fn new(replica: ReplicaId) -> Self {
        LamportClock {
            counter: AtomicU64::new(0),
            replica,
        }
    }

    /// Issues the next operation id for this replica.
    pub fn tick(&self) -> OpId {
        let counter = self.counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        OpId::new(counter, self.replica)
    }

    /// Advances the clock past a remotely observed id.
    ///
    /// Must be called for every remote operation before any further local
    /// tick, so that locally issued ids sort after everything already seen.
    pub fn observe(&self, remote: OpId) {
        let mut current = self.counter.load(AtomicOrdering::SeqCst);
        while current < remote.counter {
            match self.counter.compare_exchange_weak(
                current,
                remote.counter,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current counter value (for diagnostics and tests).
    pub fn current(&self) -> u64 {
        self.counter.load(AtomicOrdering::SeqCst)
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }
}
