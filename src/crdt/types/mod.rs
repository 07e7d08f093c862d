//! Fundamental identifier and clock types for the synchronization engine.
//!
//! Everything else in the CRDT layer is built on these: replica ids,
//! operation ids, hybrid write stamps, the Lamport clock that issues ids,
//! and the vector clock that tracks causal history.

pub mod clock;
pub mod op_id;
pub mod replica;
pub mod stamp;
pub mod version;

pub use clock::LamportClock;
pub use op_id::OpId;
pub use replica::ReplicaId;
pub use stamp::{HybridClock, Stamp};
pub use version::VectorClock;
