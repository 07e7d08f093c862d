//! Conflict-free replicated data types and their document composition.
//!
//! The types here implement the merge rules the whole system rests on:
//! last-write-wins registers, maps and sets; the replicated growable array
//! for ordered sequences; rich text layering formatting over a sequence;
//! and [`CrdtDocument`], which composes named fields with an operation log
//! and a vector clock into one addressable document.

pub mod document;
pub mod lww;
pub mod operation;
pub mod rga;
pub mod richtext;
pub mod types;

pub use document::{ApplyOutcome, CrdtDocument, FieldState};
pub use lww::{LwwEntry, LwwMap, LwwRegister, LwwSet};
pub use operation::{FieldKind, OpKind, Operation};
pub use rga::{Element, Integrated, Rga};
pub use richtext::{FormatSpan, RichText};
pub use types::{HybridClock, LamportClock, OpId, ReplicaId, Stamp, VectorClock};
