//! Error taxonomy for the synchronization engine.
//!
//! Only genuinely exceptional conditions live here. Expected conflict
//! outcomes (an LWW write losing, a sequence tie-break, an undo racing a
//! newer remote edit, duplicate delivery, causal buffering) are ordinary
//! return values on the merge path, never errors.

use thiserror::Error;

use crate::crdt::operation::FieldKind;

#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation targets a field whose CRDT kind does not match.
    /// The operation is discarded without any partial application.
    #[error("field `{field}` holds a {expected} but the operation targets a {got}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        got: FieldKind,
    },

    #[error("document `{0}` not found")]
    UnknownDocument(String),

    #[error("field `{0}` not found")]
    UnknownField(String),

    /// The rules evaluator rejected the operation; no state was mutated.
    #[error("operation denied: {reason}")]
    Denied { reason: String },

    /// Durable write failed. In-memory state stays applied; callers log a
    /// degraded-durability warning and retry, they do not roll back.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
