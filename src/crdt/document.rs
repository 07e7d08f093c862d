//! Document composition: named CRDT fields, op log, and merge entrypoint.
//!
//! A [`CrdtDocument`] owns everything replicated for one document id: the
//! field states, the vector clock, and the append-only operation log. It is
//! the single serialization point for that document: callers hold its lock
//! and hand operations in one at a time. The CRDT math tolerates arbitrary
//! arrival order across replicas, not intra-replica application races.

use std::collections::BTreeMap;

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::lww::{LwwEntry, LwwMap, LwwRegister, LwwSet};
use crate::crdt::operation::{FieldKind, OpKind, Operation};
use crate::crdt::rga::{Element, Integrated};
use crate::crdt::richtext::{FormatSpan, RichText};
use crate::crdt::types::{HybridClock, LamportClock, OpId, ReplicaId, Stamp, VectorClock};
use crate::error::SyncError;

/// State of one named field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "field_kind", rename_all = "snake_case")]
pub enum FieldState {
    Register(LwwRegister),
    Map(LwwMap),
    Set(LwwSet),
    Text(RichText),
}

impl FieldState {
    fn new_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Register => FieldState::Register(LwwRegister::new()),
            FieldKind::Map => FieldState::Map(LwwMap::new()),
            FieldKind::Set => FieldState::Set(LwwSet::new()),
            FieldKind::Text => FieldState::Text(RichText::new()),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldState::Register(_) => FieldKind::Register,
            FieldState::Map(_) => FieldKind::Map,
            FieldState::Set(_) => FieldKind::Set,
            FieldState::Text(_) => FieldKind::Text,
        }
    }

    /// Reader-facing value of the field.
    pub fn materialize(&self) -> Value {
        match self {
            FieldState::Register(reg) => reg.get().cloned().unwrap_or(Value::Null),
            FieldState::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.to_owned(), v.clone()))
                    .collect(),
            ),
            FieldState::Set(set) => Value::Array(
                set.members()
                    .map(|m| Value::String(m.to_owned()))
                    .collect(),
            ),
            FieldState::Text(text) => Value::String(text.to_text()),
        }
    }
}

/// Result of handing one operation to the document.
///
/// All three outcomes are normal control flow. `Buffered` means a causal
/// prerequisite has not arrived yet; the operation is retried automatically
/// as later operations land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    Buffered,
}

/// One addressable collaborative document.
pub struct CrdtDocument {
    doc_id: String,
    fields: BTreeMap<String, FieldState>,
    clock: LamportClock,
    stamps: HybridClock,
    vclock: VectorClock,
    /// Append-only log since the last snapshot, ordered by op id. Doubles
    /// as the duplicate-suppression index.
    log: SkipMap<OpId, Operation>,
    /// Operations waiting for a causal prerequisite.
    pending: Vec<Operation>,
    version: u64,
}

impl CrdtDocument {
    pub fn new(doc_id: impl Into<String>, replica: ReplicaId) -> Self {
        CrdtDocument {
            doc_id: doc_id.into(),
            fields: BTreeMap::new(),
            clock: LamportClock::new(replica),
            stamps: HybridClock::new(replica),
            vclock: VectorClock::new(),
            log: SkipMap::new(),
            pending: Vec::new(),
            version: 0,
        }
    }

    /// Rebuilds a document from snapshot parts; the log starts empty.
    pub fn from_parts(
        doc_id: impl Into<String>,
        replica: ReplicaId,
        mut fields: BTreeMap<String, FieldState>,
        vclock: VectorClock,
        version: u64,
    ) -> Self {
        for state in fields.values_mut() {
            if let FieldState::Text(text) = state {
                text.reindex();
            }
        }
        let clock = LamportClock::new(replica);
        for (replica_seen, counter) in vclock.iter() {
            clock.observe(OpId::new(counter, replica_seen));
        }
        CrdtDocument {
            doc_id: doc_id.into(),
            fields,
            clock,
            stamps: HybridClock::new(replica),
            vclock,
            log: SkipMap::new(),
            pending: Vec::new(),
            version,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Issues a fresh op id for a locally created operation.
    pub fn next_op_id(&self) -> OpId {
        self.clock.tick()
    }

    /// Issues a fresh LWW stamp for a locally created operation.
    pub fn next_stamp(&self) -> Stamp {
        self.stamps.now()
    }

    /// Applies a locally created operation.
    ///
    /// Local operations are causally ready by construction, so this is the
    /// same code path as [`merge`](Self::merge); the distinction exists for
    /// call sites and tracing.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        self.merge(op)
    }

    /// Merges a remote (or local) operation into the document.
    ///
    /// Duplicate delivery is a no-op; a causally unready operation is
    /// buffered and retried once its prerequisite lands. A type-mismatched
    /// operation is rejected with a typed error and never partially applied.
    pub fn merge(&mut self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        if self.log.contains_key(&op.id) || self.vclock.contains(op.id) {
            return Ok(ApplyOutcome::Duplicate);
        }

        if !self.is_ready(&op) {
            tracing::debug!(doc = %self.doc_id, op = %op.id, "buffering causally unready operation");
            self.pending.push(op);
            return Ok(ApplyOutcome::Buffered);
        }

        self.apply_ready(op)?;
        self.drain_pending();
        Ok(ApplyOutcome::Applied)
    }

    /// Whether the operation's causal prerequisite is already integrated.
    fn is_ready(&self, op: &Operation) -> bool {
        match op.dependency() {
            None => true,
            Some(dep) => match self.fields.get(&op.field) {
                Some(FieldState::Text(text)) => text.content().contains(dep),
                // Field not created yet: the prerequisite insert is missing.
                None => false,
                // Wrong field kind; let apply_ready reject it with a real error.
                Some(_) => true,
            },
        }
    }

    fn apply_ready(&mut self, op: Operation) -> Result<(), SyncError> {
        let kind = op.field_kind();
        let state = self
            .fields
            .entry(op.field.clone())
            .or_insert_with(|| FieldState::new_for(kind));

        if state.kind() != kind {
            return Err(SyncError::TypeMismatch {
                field: op.field.clone(),
                expected: state.kind(),
                got: kind,
            });
        }

        match (&op.kind, state) {
            (OpKind::Set { value, stamp }, FieldState::Register(reg)) => {
                reg.merge(LwwEntry::write(value.clone(), *stamp));
            }
            (OpKind::Remove { stamp }, FieldState::Register(reg)) => {
                reg.merge(LwwEntry::tombstone(*stamp));
            }
            (OpKind::MapSet { key, value, stamp }, FieldState::Map(map)) => {
                map.merge_entry(key, LwwEntry::write(value.clone(), *stamp));
            }
            (OpKind::MapRemove { key, stamp }, FieldState::Map(map)) => {
                map.merge_entry(key, LwwEntry::tombstone(*stamp));
            }
            (OpKind::SetAdd { member, stamp }, FieldState::Set(set)) => {
                set.merge_entry(member, LwwEntry::write(Value::Null, *stamp));
            }
            (OpKind::SetRemove { member, stamp }, FieldState::Set(set)) => {
                set.merge_entry(member, LwwEntry::tombstone(*stamp));
            }
            (OpKind::TextInsert { origin, ch }, FieldState::Text(text)) => {
                // Readiness was checked above, so the origin is present.
                match text.integrate(Element::new(op.id, *origin, *ch)) {
                    Integrated::Placed | Integrated::Duplicate => {}
                    Integrated::MissingOrigin => {
                        // Unreachable given is_ready, but losing an insert
                        // silently would be worse than a late buffer.
                        self.pending.push(op.clone());
                        return Ok(());
                    }
                }
            }
            (OpKind::TextDelete { target }, FieldState::Text(text)) => {
                text.delete(*target);
            }
            (
                OpKind::TextFormat {
                    span_id,
                    start,
                    end,
                    attrs,
                    stamp,
                },
                FieldState::Text(text),
            ) => {
                text.format(
                    span_id,
                    FormatSpan {
                        start: *start,
                        end: *end,
                        attrs: attrs.clone(),
                    },
                    *stamp,
                );
            }
            (OpKind::TextUnformat { span_id, stamp }, FieldState::Text(text)) => {
                text.unformat(span_id, *stamp);
            }
            // kind() already matched, so variant/state pairs line up.
            _ => unreachable!("operation kind checked against field state"),
        }

        self.clock.observe(op.id);
        self.vclock.record(op.id);
        self.version += 1;
        self.log.insert(op.id, op);
        Ok(())
    }

    /// Re-evaluates buffered operations until a pass makes no progress.
    fn drain_pending(&mut self) {
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.pending);
            for op in waiting {
                if self.log.contains_key(&op.id) {
                    continue;
                }
                if self.is_ready(&op) {
                    match self.apply_ready(op) {
                        Ok(()) => progressed = true,
                        Err(err) => {
                            // Malformed buffered op: drop it, do not poison the rest.
                            tracing::warn!(doc = %self.doc_id, error = %err, "discarding buffered operation");
                        }
                    }
                } else {
                    self.pending.push(op);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Operations this document has applied that `since` has not seen,
    /// in id order. Used to resume a lagging replica.
    pub fn diff_since(&self, since: &VectorClock) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|entry| !since.contains(*entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn state_vector(&self) -> VectorClock {
        self.vclock.clone()
    }

    /// Materialized reader view: field name to visible value.
    pub fn materialize(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(name, state)| (name.clone(), state.materialize()))
                .collect(),
        )
    }

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.get(name)
    }

    /// Clones the full field states, for snapshot capture.
    pub fn field_states(&self) -> BTreeMap<String, FieldState> {
        self.fields.clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Count of operations buffered on a causal gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Log entries strictly after `after`, in id order.
    pub fn log_tail(&self, after: &VectorClock) -> Vec<Operation> {
        self.diff_since(after)
    }

    /// Discards log entries covered by the low-water mark.
    ///
    /// Safe once every known replica has acknowledged the mark: nobody can
    /// ask for those entries through `diff_since` again. The vector clock
    /// keeps covering pruned ids, so a pruned operation re-delivered later
    /// still reads as a duplicate.
    pub fn prune_log(&mut self, low_water: &VectorClock) -> usize {
        let discardable: Vec<OpId> = self
            .log
            .iter()
            .filter(|entry| low_water.contains(*entry.key()))
            .map(|entry| *entry.key())
            .collect();
        for id in &discardable {
            self.log.remove(id);
        }
        discardable.len()
    }

    // Local operation constructors. Each issues a fresh id (and stamp where
    // the kind needs one) from this document's clocks.

    pub fn new_set_op(&self, field: &str, value: Value) -> Operation {
        Operation::new(
            self.next_op_id(),
            field,
            OpKind::Set {
                value,
                stamp: self.next_stamp(),
            },
        )
    }

    pub fn new_remove_op(&self, field: &str) -> Operation {
        Operation::new(
            self.next_op_id(),
            field,
            OpKind::Remove {
                stamp: self.next_stamp(),
            },
        )
    }

    pub fn new_map_set_op(&self, field: &str, key: &str, value: Value) -> Operation {
        Operation::new(
            self.next_op_id(),
            field,
            OpKind::MapSet {
                key: key.to_owned(),
                value,
                stamp: self.next_stamp(),
            },
        )
    }

    pub fn new_text_insert_op(&self, field: &str, origin: Option<OpId>, ch: char) -> Operation {
        Operation::new(self.next_op_id(), field, OpKind::TextInsert { origin, ch })
    }

    pub fn new_text_delete_op(&self, field: &str, target: OpId) -> Operation {
        Operation::new(self.next_op_id(), field, OpKind::TextDelete { target })
    }
}
