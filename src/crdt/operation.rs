//! The tagged-union operation type.
//!
//! Every mutation that travels between replicas is one of these. Operations
//! are validated at the protocol boundary before they reach the merge
//! pipeline and are immutable once created.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crdt::types::{OpId, Stamp};

/// The CRDT kind a field holds. Fixed by the first operation that touches
/// the field; later operations of a different kind are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Register,
    Map,
    Set,
    Text,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Register => "register",
            FieldKind::Map => "map",
            FieldKind::Set => "set",
            FieldKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// One variant per field mutation the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Overwrite a register field.
    Set { value: Value, stamp: Stamp },
    /// Tombstone a register field.
    Remove { stamp: Stamp },
    /// Write one key of a map field.
    MapSet {
        key: String,
        value: Value,
        stamp: Stamp,
    },
    /// Tombstone one key of a map field.
    MapRemove { key: String, stamp: Stamp },
    /// Add a member to a set field.
    SetAdd { member: String, stamp: Stamp },
    /// Remove a member from a set field.
    SetRemove { member: String, stamp: Stamp },
    /// Insert a character after `origin` (`None` = document head).
    TextInsert { origin: Option<OpId>, ch: char },
    /// Tombstone the character identified by `target`.
    TextDelete { target: OpId },
    /// Write a formatting span anchored to element ids.
    TextFormat {
        span_id: String,
        start: OpId,
        end: OpId,
        attrs: Map<String, Value>,
        stamp: Stamp,
    },
    /// Remove a formatting span.
    TextUnformat { span_id: String, stamp: Stamp },
}

/// An immutable, globally identified mutation of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub field: String,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, field: impl Into<String>, kind: OpKind) -> Self {
        Operation {
            id,
            field: field.into(),
            kind,
        }
    }

    /// The field kind this operation targets.
    pub fn field_kind(&self) -> FieldKind {
        match self.kind {
            OpKind::Set { .. } | OpKind::Remove { .. } => FieldKind::Register,
            OpKind::MapSet { .. } | OpKind::MapRemove { .. } => FieldKind::Map,
            OpKind::SetAdd { .. } | OpKind::SetRemove { .. } => FieldKind::Set,
            OpKind::TextInsert { .. }
            | OpKind::TextDelete { .. }
            | OpKind::TextFormat { .. }
            | OpKind::TextUnformat { .. } => FieldKind::Text,
        }
    }

    /// The causal prerequisite, if any: the operation that must already be
    /// applied before this one can integrate. LWW operations have none;
    /// they commute with everything.
    pub fn dependency(&self) -> Option<OpId> {
        match &self.kind {
            OpKind::TextInsert { origin, .. } => *origin,
            OpKind::TextDelete { target } => Some(*target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_shape() {
        let op = Operation::new(
            OpId::new(3, 1),
            "title",
            OpKind::Set {
                value: json!("hello"),
                stamp: Stamp::new(100, 1),
            },
        );

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "set");
        assert_eq!(json["field"], "title");
        assert_eq!(json["value"], "hello");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_field_kind_mapping() {
        let id = OpId::new(1, 1);
        let stamp = Stamp::new(1, 1);

        let set = Operation::new(id, "f", OpKind::Set { value: json!(1), stamp });
        let add = Operation::new(
            id,
            "f",
            OpKind::SetAdd {
                member: "m".into(),
                stamp,
            },
        );
        let ins = Operation::new(id, "f", OpKind::TextInsert { origin: None, ch: 'x' });

        assert_eq!(set.field_kind(), FieldKind::Register);
        assert_eq!(add.field_kind(), FieldKind::Set);
        assert_eq!(ins.field_kind(), FieldKind::Text);
    }

    #[test]
    fn test_dependencies() {
        let id = OpId::new(5, 2);
        let origin = OpId::new(3, 1);

        let ins = Operation::new(
            id,
            "body",
            OpKind::TextInsert {
                origin: Some(origin),
                ch: 'x',
            },
        );
        let del = Operation::new(id, "body", OpKind::TextDelete { target: origin });
        let head = Operation::new(id, "body", OpKind::TextInsert { origin: None, ch: 'y' });

        assert_eq!(ins.dependency(), Some(origin));
        assert_eq!(del.dependency(), Some(origin));
        assert_eq!(head.dependency(), None);
    }
}
