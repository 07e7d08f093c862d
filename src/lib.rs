//! # Collab Sync - Real-Time Collaborative Document Store
//!
//! A server for real-time collaborative editing over conflict-free
//! replicated data types (CRDTs), where concurrent edits from many clients
//! converge without coordination.
//!
//! ## Features
//!
//! - **Conflict-free**: last-write-wins registers, maps and sets plus an
//!   RGA sequence for collaborative text, all convergent under any
//!   delivery order
//! - **Causally consistent**: Lamport clocks order operations; buffering
//!   holds an operation until its dependency has arrived
//! - **Durable**: every operation lands in an append-only sync log, with
//!   periodic snapshots to bound replay
//! - **Aware**: ephemeral presence (cursors, user metadata) with TTL
//!   eviction, and per-client undo/redo that never rewrites history
//!
//! ## Example
//!
//! ```rust
//! use collab_sync::crdt::CrdtDocument;
//! use serde_json::json;
//!
//! let mut doc = CrdtDocument::new("notes/1", 1);
//! let op = doc.new_set_op("title", json!("hello"));
//! doc.apply(op).unwrap();
//! assert_eq!(doc.materialize()["title"], json!("hello"));
//! ```

pub mod auth;
pub mod config;
pub mod crdt;
pub mod error;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::SyncConfig;
pub use crdt::{CrdtDocument, LamportClock, OpId, Operation, ReplicaId, VectorClock};
pub use error::SyncError;
pub use server::{Hub, create_router};
