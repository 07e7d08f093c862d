//! Operation identifiers.
//!
//! Every operation carries an [`OpId`] pairing the originating replica with
//! a Lamport counter. The id is globally unique, which makes it usable both
//! for duplicate suppression and as the deterministic tie-break key in the
//! sequence CRDT.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crdt::types::replica::ReplicaId;

/// Globally unique operation identifier.
///
/// Ordered first by Lamport counter, then by replica id. Counters issued by
/// one replica are strictly increasing, and the replica id breaks ties
/// between counters issued concurrently on different replicas, so the
/// ordering is total and identical on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// Lamport counter value at the time the operation was created.
    pub counter: u64,
    /// The replica that created the operation.
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        OpId { counter, replica }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.replica.cmp(&other.replica),
            other => other,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}
