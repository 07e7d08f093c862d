//! Synchronization machinery around the CRDT core.
//!
//! Batching and compression of outgoing operations, snapshot capture and
//! replay, per-client undo/redo, ephemeral presence, and the cross-process
//! replication bus.

pub mod batcher;
pub mod bus;
pub mod presence;
pub mod snapshot;
pub mod undo;

pub use batcher::OpBatcher;
pub use bus::{BusEvent, ReplicationBus};
pub use presence::{CursorState, PresenceManager, PresenceSession};
pub use snapshot::{Snapshot, SnapshotManager};
pub use undo::{UndoEntry, UndoManager, UndoState};
