//! Per-client undo/redo over the shared operation log.
//!
//! Undo never rewrites history: it synthesizes a brand-new forward
//! operation, with its own id and stamp, that restores the previous value.
//! If a remote edit already changed the same key with a newer stamp, the
//! undo operation simply loses the LWW race; that is the documented
//! outcome, not an error.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::crdt::document::CrdtDocument;
use crate::crdt::operation::{OpKind, Operation};
use crate::crdt::types::{OpId, ReplicaId};
use crate::error::SyncError;

/// One undoable local edit, carrying enough to invert it and to re-apply
/// it on redo.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// A register write: `before` and `after` are the visible values around
    /// the edit (`None` means unset/tombstoned).
    Register {
        field: String,
        before: Option<Value>,
        after: Option<Value>,
    },
    /// A map-key write.
    MapKey {
        field: String,
        key: String,
        before: Option<Value>,
        after: Option<Value>,
    },
    /// A text insertion; undo tombstones `id`, redo reinserts the character
    /// with a fresh id at the same origin.
    TextInsert {
        field: String,
        id: OpId,
        origin: Option<OpId>,
        ch: char,
    },
    /// A text deletion; undo reinserts with a fresh id at the same origin.
    TextDelete {
        field: String,
        id: OpId,
        origin: Option<OpId>,
        ch: char,
    },
}

impl UndoEntry {
    /// Derives an entry from a captured forward operation plus the value it
    /// overwrote, as reported by the client at capture time.
    pub fn from_capture(doc: &CrdtDocument, op: &Operation, previous: Option<Value>) -> Option<Self> {
        match &op.kind {
            OpKind::Set { value, .. } => Some(UndoEntry::Register {
                field: op.field.clone(),
                before: previous,
                after: Some(value.clone()),
            }),
            OpKind::Remove { .. } => Some(UndoEntry::Register {
                field: op.field.clone(),
                before: previous,
                after: None,
            }),
            OpKind::MapSet { key, value, .. } => Some(UndoEntry::MapKey {
                field: op.field.clone(),
                key: key.clone(),
                before: previous,
                after: Some(value.clone()),
            }),
            OpKind::MapRemove { key, .. } => Some(UndoEntry::MapKey {
                field: op.field.clone(),
                key: key.clone(),
                before: previous,
                after: None,
            }),
            OpKind::TextInsert { origin, ch } => Some(UndoEntry::TextInsert {
                field: op.field.clone(),
                id: op.id,
                origin: *origin,
                ch: *ch,
            }),
            OpKind::TextDelete { target } => {
                let element = match doc.field(&op.field) {
                    Some(crate::crdt::document::FieldState::Text(text)) => {
                        text.content().get(*target).copied()
                    }
                    _ => None,
                };
                element.map(|el| UndoEntry::TextDelete {
                    field: op.field.clone(),
                    id: el.id,
                    origin: el.origin,
                    ch: el.ch,
                })
            }
            // Formatting and set membership are not captured for undo.
            _ => None,
        }
    }
}

/// Reported stack depths for the `undo_state` message.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UndoState {
    #[serde(rename = "canUndo")]
    pub can_undo: bool,
    #[serde(rename = "canRedo")]
    pub can_redo: bool,
    #[serde(rename = "undoCount")]
    pub undo_count: usize,
    #[serde(rename = "redoCount")]
    pub redo_count: usize,
}

#[derive(Default)]
struct Stacks {
    undo: Vec<UndoEntry>,
    redo: Vec<UndoEntry>,
}

/// Undo/redo stacks per (client, document).
///
/// Stacks live only as long as the session; they are dropped wholesale on
/// disconnect and are never persisted.
pub struct UndoManager {
    stacks: Mutex<HashMap<(ReplicaId, String), Stacks>>,
    max_depth: usize,
}

impl UndoManager {
    pub fn new(max_depth: usize) -> Self {
        UndoManager {
            stacks: Mutex::new(HashMap::new()),
            max_depth: max_depth.max(1),
        }
    }

    /// Records a new local edit. Any redo history is invalidated.
    pub fn capture(&self, client: ReplicaId, doc_id: &str, entry: UndoEntry) -> UndoState {
        let mut stacks = self.stacks.lock();
        let slot = stacks.entry((client, doc_id.to_owned())).or_default();
        slot.redo.clear();
        slot.undo.push(entry);
        if slot.undo.len() > self.max_depth {
            slot.undo.remove(0);
        }
        state_of(slot)
    }

    pub fn state(&self, client: ReplicaId, doc_id: &str) -> UndoState {
        let stacks = self.stacks.lock();
        match stacks.get(&(client, doc_id.to_owned())) {
            Some(slot) => state_of(slot),
            None => UndoState {
                can_undo: false,
                can_redo: false,
                undo_count: 0,
                redo_count: 0,
            },
        }
    }

    /// Pops the top entry and applies a fresh inverse operation to the
    /// document. Returns `None` when there is nothing to undo.
    pub fn undo(
        &self,
        client: ReplicaId,
        doc: &mut CrdtDocument,
    ) -> Result<Option<Operation>, SyncError> {
        let key = (client, doc.doc_id().to_owned());
        let entry = {
            let mut stacks = self.stacks.lock();
            match stacks.get_mut(&key).and_then(|slot| slot.undo.pop()) {
                Some(entry) => entry,
                None => return Ok(None),
            }
        };

        let (op, redo_entry) = synthesize_inverse(doc, entry)?;
        doc.apply(op.clone())?;

        let mut stacks = self.stacks.lock();
        stacks.entry(key).or_default().redo.push(redo_entry);
        Ok(Some(op))
    }

    /// Re-applies the most recently undone edit as a fresh operation.
    pub fn redo(
        &self,
        client: ReplicaId,
        doc: &mut CrdtDocument,
    ) -> Result<Option<Operation>, SyncError> {
        let key = (client, doc.doc_id().to_owned());
        let entry = {
            let mut stacks = self.stacks.lock();
            match stacks.get_mut(&key).and_then(|slot| slot.redo.pop()) {
                Some(entry) => entry,
                None => return Ok(None),
            }
        };

        let (op, undo_entry) = synthesize_forward(doc, entry)?;
        doc.apply(op.clone())?;

        let mut stacks = self.stacks.lock();
        stacks.entry(key).or_default().undo.push(undo_entry);
        Ok(Some(op))
    }

    /// Drops every stack belonging to a disconnected client.
    pub fn drop_client(&self, client: ReplicaId) {
        self.stacks.lock().retain(|(owner, _), _| *owner != client);
    }
}

fn state_of(slot: &Stacks) -> UndoState {
    UndoState {
        can_undo: !slot.undo.is_empty(),
        can_redo: !slot.redo.is_empty(),
        undo_count: slot.undo.len(),
        redo_count: slot.redo.len(),
    }
}

/// Builds the operation that reverts `entry`, plus the entry to push on the
/// redo stack.
fn synthesize_inverse(
    doc: &CrdtDocument,
    entry: UndoEntry,
) -> Result<(Operation, UndoEntry), SyncError> {
    match entry {
        UndoEntry::Register { field, before, after } => {
            let op = match &before {
                Some(value) => doc.new_set_op(&field, value.clone()),
                None => doc.new_remove_op(&field),
            };
            Ok((op, UndoEntry::Register { field, before, after }))
        }
        UndoEntry::MapKey {
            field,
            key,
            before,
            after,
        } => {
            let op = match &before {
                Some(value) => doc.new_map_set_op(&field, &key, value.clone()),
                None => Operation::new(
                    doc.next_op_id(),
                    &field,
                    OpKind::MapRemove {
                        key: key.clone(),
                        stamp: doc.next_stamp(),
                    },
                ),
            };
            Ok((op, UndoEntry::MapKey { field, key, before, after }))
        }
        UndoEntry::TextInsert { field, id, origin, ch } => {
            let op = doc.new_text_delete_op(&field, id);
            Ok((op, UndoEntry::TextInsert { field, id, origin, ch }))
        }
        UndoEntry::TextDelete { field, origin, ch, .. } => {
            // Reinsert as a brand-new element at the same origin.
            let op = doc.new_text_insert_op(&field, origin, ch);
            let id = op.id;
            Ok((op, UndoEntry::TextDelete { field, id, origin, ch }))
        }
    }
}

/// Builds the operation that re-applies `entry`, plus the entry to push
/// back on the undo stack.
fn synthesize_forward(
    doc: &CrdtDocument,
    entry: UndoEntry,
) -> Result<(Operation, UndoEntry), SyncError> {
    match entry {
        UndoEntry::Register { field, before, after } => {
            let op = match &after {
                Some(value) => doc.new_set_op(&field, value.clone()),
                None => doc.new_remove_op(&field),
            };
            Ok((op, UndoEntry::Register { field, before, after }))
        }
        UndoEntry::MapKey {
            field,
            key,
            before,
            after,
        } => {
            let op = match &after {
                Some(value) => doc.new_map_set_op(&field, &key, value.clone()),
                None => Operation::new(
                    doc.next_op_id(),
                    &field,
                    OpKind::MapRemove {
                        key: key.clone(),
                        stamp: doc.next_stamp(),
                    },
                ),
            };
            Ok((op, UndoEntry::MapKey { field, key, before, after }))
        }
        UndoEntry::TextInsert { field, origin, ch, .. } => {
            // Redo of an insert is a fresh insert at the same origin.
            let op = doc.new_text_insert_op(&field, origin, ch);
            let id = op.id;
            Ok((op, UndoEntry::TextInsert { field, id, origin, ch }))
        }
        UndoEntry::TextDelete { field, id, origin, ch } => {
            let op = doc.new_text_delete_op(&field, id);
            Ok((op, UndoEntry::TextDelete { field, id, origin, ch }))
        }
    }
}
