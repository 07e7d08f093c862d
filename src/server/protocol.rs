//! Wire protocol for the real-time WebSocket surface.
//!
//! Every frame is a JSON object tagged by `type`. Client messages are
//! validated here, at the protocol boundary, before anything reaches the
//! merge pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::operation::Operation;
use crate::crdt::types::{OpId, ReplicaId, VectorClock};
use crate::sync::presence::{CursorState, PresenceSession};
use crate::sync::undo::UndoState;

/// Messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        collection: String,
    },
    DocSave {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        data: Value,
    },
    DocGet {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Submit one CRDT operation.
    Op {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        op: Operation,
    },
    /// Submit a coalesced batch of operations.
    OpBatch {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        ops: Vec<Operation>,
    },
    /// Resume a lagging replica: ask for everything after `since`.
    SyncRequest {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        since: VectorClock,
    },
    PresenceJoin {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        user: Value,
    },
    PresenceCursor {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        position: Value,
        #[serde(default)]
        selection: Option<Value>,
    },
    PresenceUpdate {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        user: Value,
    },
    PresenceGet {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    PresenceLeave {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    UndoCapture {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        op: Operation,
        #[serde(rename = "previousValue", default)]
        previous_value: Option<Value>,
    },
    UndoState {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    Undo {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    Redo {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    Ping {
        time: i64,
    },
}

/// Messages the server sends, as replies or broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        collection: String,
    },
    DocSaved {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        version: u64,
    },
    DocCreated {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        version: u64,
    },
    Doc {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        data: Value,
        version: u64,
    },
    DocNotFound {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Acknowledges a submitted operation.
    OpAck {
        #[serde(rename = "opId")]
        op_id: OpId,
        outcome: String,
    },
    /// A batch member that could not be applied. The rest of the batch is
    /// still processed and acked individually.
    OpRejected {
        #[serde(rename = "opId")]
        op_id: OpId,
        message: String,
    },
    /// Operations from other replicas, coalesced per document and fanned
    /// out to subscribers as one frame.
    OpBatch {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        ops: Vec<Operation>,
    },
    /// Reply to `sync_request`: the missed operations plus the clock to
    /// resume from.
    SyncDiff {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        ops: Vec<Operation>,
        clock: VectorClock,
    },
    PresenceJoinOk {
        #[serde(rename = "nodeId")]
        node_id: ReplicaId,
        users: Vec<PresenceSession>,
    },
    PresenceJoined {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        session: PresenceSession,
    },
    PresenceCursorMoved {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        replica: ReplicaId,
        cursor: CursorState,
    },
    PresenceUpdated {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        replica: ReplicaId,
        user: Value,
    },
    PresenceUsers {
        count: usize,
        users: Vec<PresenceSession>,
    },
    PresenceLeft {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        replica: ReplicaId,
    },
    UndoCaptureOk {
        state: UndoState,
    },
    UndoState {
        #[serde(flatten)]
        state: UndoState,
    },
    UndoOk {
        op: Operation,
        state: UndoState,
    },
    UndoEmpty,
    RedoOk {
        op: Operation,
        state: UndoState,
    },
    RedoEmpty,
    Pong {
        time: i64,
    },
    Error {
        message: String,
    },
}
