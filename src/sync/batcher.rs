//! Outgoing operation batching and coalescing.
//!
//! Operations produced inside a short local window are collected and sent
//! as one batch. Repeated LWW writes to the same (field, key) collapse to
//! the final one: the earlier writes would lose the stamp race on every
//! receiver anyway, so coalescing is a pure optimization that never changes
//! the convergent state. Sequence operations are never coalesced.

use std::time::{Duration, Instant};

use crate::crdt::operation::{OpKind, Operation};

/// Coalescing identity of an LWW operation: later ops with the same key
/// supersede earlier ones inside a batch.
#[derive(Debug, PartialEq, Eq)]
enum CoalesceKey<'a> {
    Register(&'a str),
    MapKey(&'a str, &'a str),
    SetMember(&'a str, &'a str),
    Span(&'a str, &'a str),
}

fn coalesce_key(op: &Operation) -> Option<CoalesceKey<'_>> {
    match &op.kind {
        OpKind::Set { .. } | OpKind::Remove { .. } => Some(CoalesceKey::Register(&op.field)),
        OpKind::MapSet { key, .. } | OpKind::MapRemove { key, .. } => {
            Some(CoalesceKey::MapKey(&op.field, key))
        }
        OpKind::SetAdd { member, .. } | OpKind::SetRemove { member, .. } => {
            Some(CoalesceKey::SetMember(&op.field, member))
        }
        OpKind::TextFormat { span_id, .. } | OpKind::TextUnformat { span_id, .. } => {
            Some(CoalesceKey::Span(&op.field, span_id))
        }
        OpKind::TextInsert { .. } | OpKind::TextDelete { .. } => None,
    }
}

/// Accumulates outgoing operations until a flush trigger fires.
///
/// Flush triggers: the size threshold (`push` returns the full batch), the
/// elapsed-time window (callers poll [`deadline_due`](Self::deadline_due)
/// on a timer), or an explicit [`flush`](Self::flush) before disconnect.
pub struct OpBatcher {
    pending: Vec<Operation>,
    max_ops: usize,
    max_delay: Duration,
    opened_at: Option<Instant>,
}

impl OpBatcher {
    pub fn new(max_ops: usize, max_delay: Duration) -> Self {
        OpBatcher {
            pending: Vec::new(),
            max_ops: max_ops.max(1),
            max_delay,
            opened_at: None,
        }
    }

    /// Adds an operation, coalescing against the open batch. Returns the
    /// batch when the size threshold trips.
    pub fn push(&mut self, op: Operation) -> Option<Vec<Operation>> {
        if let Some(key) = coalesce_key(&op) {
            self.pending
                .retain(|held| coalesce_key(held).as_ref() != Some(&key));
        }

        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.push(op);

        if self.pending.len() >= self.max_ops {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Drains the open batch unconditionally.
    pub fn flush(&mut self) -> Vec<Operation> {
        self.opened_at = None;
        std::mem::take(&mut self.pending)
    }

    /// Whether the elapsed-time trigger has fired for the open batch.
    pub fn deadline_due(&self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) => now.duration_since(opened) >= self.max_delay,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::types::{OpId, Stamp};
    use serde_json::json;

    fn set_op(counter: u64, field: &str, value: serde_json::Value) -> Operation {
        Operation::new(
            OpId::new(counter, 1),
            field,
            OpKind::Set {
                value,
                stamp: Stamp::new(counter as i64, 1),
            },
        )
    }

    #[test]
    fn test_coalesces_repeated_writes_to_one_key() {
        let mut batcher = OpBatcher::new(100, Duration::from_millis(50));

        batcher.push(set_op(1, "title", json!("a")));
        batcher.push(set_op(2, "title", json!("ab")));
        batcher.push(set_op(3, "title", json!("abc")));

        let batch = batcher.flush();
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0].kind, OpKind::Set { value, .. } if *value == json!("abc")));
    }

    #[test]
    fn test_distinct_keys_do_not_coalesce() {
        let mut batcher = OpBatcher::new(100, Duration::from_millis(50));

        batcher.push(set_op(1, "title", json!("a")));
        batcher.push(set_op(2, "body", json!("b")));

        assert_eq!(batcher.len(), 2);
    }

    #[test]
    fn test_text_inserts_never_coalesce() {
        let mut batcher = OpBatcher::new(100, Duration::from_millis(50));

        batcher.push(Operation::new(
            OpId::new(1, 1),
            "body",
            OpKind::TextInsert { origin: None, ch: 'a' },
        ));
        batcher.push(Operation::new(
            OpId::new(2, 1),
            "body",
            OpKind::TextInsert {
                origin: Some(OpId::new(1, 1)),
                ch: 'b',
            },
        ));

        assert_eq!(batcher.len(), 2);
    }

    #[test]
    fn test_size_threshold_flushes() {
        let mut batcher = OpBatcher::new(2, Duration::from_secs(60));

        assert!(batcher.push(set_op(1, "a", json!(1))).is_none());
        let batch = batcher.push(set_op(2, "b", json!(2)));

        assert_eq!(batch.map(|b| b.len()), Some(2));
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_deadline_trigger() {
        let mut batcher = OpBatcher::new(100, Duration::from_millis(0));
        assert!(!batcher.deadline_due(Instant::now()));

        batcher.push(set_op(1, "a", json!(1)));
        assert!(batcher.deadline_due(Instant::now()));

        batcher.flush();
        assert!(!batcher.deadline_due(Instant::now()));
    }

    #[test]
    fn test_remove_supersedes_set_in_batch() {
        let mut batcher = OpBatcher::new(100, Duration::from_millis(50));

        batcher.push(set_op(1, "title", json!("a")));
        batcher.push(Operation::new(
            OpId::new(2, 1),
            "title",
            OpKind::Remove {
                stamp: Stamp::new(2, 1),
            },
        ));

        let batch = batcher.flush();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0].kind, OpKind::Remove { .. }));
    }
}
