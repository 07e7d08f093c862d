//! Replica identifier type.
//!
//! Every connected session and every server process acts as a replica and
//! gets its own id, which is never reused while the replica is live.

/// A unique identifier for each replica (client session or server process)
/// participating in the distributed system.
///
/// Operations from different replicas are distinguished and tie-broken by
/// this id, so uniqueness is what makes the merge rules deterministic.
pub type ReplicaId = u64;
