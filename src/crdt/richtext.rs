//! Rich text: sequence content plus LWW-resolved formatting spans.
//!
//! Content merges with the RGA ordering rule; formatting spans live in an
//! LWW map keyed by span id and anchored to element ids, so they merge with
//! the register rule. The two merge independently and compose: a span keeps
//! pointing at its anchors even when text is inserted or deleted around
//! them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crdt::lww::{LwwEntry, LwwMap};
use crate::crdt::rga::{Element, Integrated, Rga};
use crate::crdt::types::{OpId, Stamp};

/// A formatting annotation over the inclusive anchor range `[start, end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatSpan {
    /// First anchored element.
    pub start: OpId,
    /// Last anchored element.
    pub end: OpId,
    /// Attribute map, e.g. `{"bold": true}`.
    pub attrs: Map<String, Value>,
}

/// Collaborative rich text field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RichText {
    content: Rga,
    spans: LwwMap,
}

impl RichText {
    pub fn new() -> Self {
        RichText::default()
    }

    /// Rebuilds indexes after deserialization.
    pub fn reindex(&mut self) {
        self.content.reindex();
    }

    pub fn integrate(&mut self, element: Element) -> Integrated {
        self.content.integrate(element)
    }

    pub fn delete(&mut self, id: OpId) -> bool {
        self.content.delete(id)
    }

    /// Applies a formatting span; the greater stamp wins per span id.
    pub fn format(&mut self, span_id: &str, span: FormatSpan, stamp: Stamp) -> bool {
        let value = serde_json::to_value(span).unwrap_or(Value::Null);
        self.spans.merge_entry(span_id, LwwEntry::write(value, stamp))
    }

    /// Removes a formatting span under the same LWW race.
    pub fn unformat(&mut self, span_id: &str, stamp: Stamp) -> bool {
        self.spans.merge_entry(span_id, LwwEntry::tombstone(stamp))
    }

    pub fn merge_span_entry(&mut self, span_id: &str, entry: LwwEntry) -> bool {
        self.spans.merge_entry(span_id, entry)
    }

    pub fn to_text(&self) -> String {
        self.content.to_text()
    }

    /// Live spans, skipping any that no longer decode.
    pub fn spans(&self) -> Vec<(String, FormatSpan)> {
        self.spans
            .iter()
            .filter_map(|(id, value)| {
                serde_json::from_value(value.clone())
                    .ok()
                    .map(|span| (id.to_owned(), span))
            })
            .collect()
    }

    pub fn content(&self) -> &Rga {
        &self.content
    }

    pub fn raw_spans(&self) -> &LwwMap {
        &self.spans
    }
}
