//! WebSocket session handling.
//!
//! One task per connection. All outbound traffic, direct replies and bus
//! fan-out alike, funnels through a single channel into a writer task, so
//! a session's frames keep the order the server produced them in. Presence
//! and operation events from other replicas arrive via per-collection
//! subscription tasks that filter out the session's own echoes and batch
//! operations per document before sending them down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Action;
use crate::crdt::document::ApplyOutcome;
use crate::crdt::operation::Operation;
use crate::crdt::types::ReplicaId;
use crate::error::SyncError;
use crate::server::hub::Hub;
use crate::server::protocol::{ClientMessage, ServerMessage};
use crate::sync::batcher::OpBatcher;
use crate::sync::bus::BusEvent;
use crate::sync::undo::UndoEntry;

/// Entry point for an upgraded connection.
pub async fn handle_connection(socket: WebSocket, hub: Arc<Hub>) {
    let replica = hub.allocate_replica();
    info!(replica, "websocket session established");

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(write_outbound(sink, rx));

    let mut session = Session {
        hub: hub.clone(),
        replica,
        tx,
        subscriptions: HashMap::new(),
        user: None,
    };
    session.run(stream).await;

    for (_, task) in session.subscriptions.drain() {
        task.abort();
    }
    hub.disconnect(replica);
    drop(session.tx);
    let _ = writer.await;
    info!(replica, "websocket session ended");
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = rx.recv().await {
        if sink.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
}

struct Session {
    hub: Arc<Hub>,
    replica: ReplicaId,
    tx: mpsc::UnboundedSender<String>,
    subscriptions: HashMap<String, JoinHandle<()>>,
    /// Last user metadata this session presented, for the rules context.
    user: Option<Value>,
}

impl Session {
    async fn run(&mut self, mut stream: SplitStream<WebSocket>) {
        while let Some(received) = stream.next().await {
            match received {
                Ok(Message::Text(text)) => {
                    if !self.handle_text(&text).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(replica = self.replica, "session closed by client");
                    break;
                }
                Ok(_) => {
                    // Binary, ping and pong frames are not part of the protocol.
                }
                Err(err) => {
                    warn!(replica = self.replica, error = %err, "websocket error");
                    break;
                }
            }
        }
    }

    /// Returns `false` when the session can no longer deliver replies.
    async fn handle_text(&mut self, text: &str) -> bool {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(replica = self.replica, error = %err, "unparseable client frame");
                return self.send(&ServerMessage::Error {
                    message: format!("unrecognized message: {err}"),
                });
            }
        };

        match self.dispatch(message).await {
            Ok(alive) => alive,
            Err(err) => self.send(&ServerMessage::Error {
                message: err.to_string(),
            }),
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<bool, SyncError> {
        match message {
            ClientMessage::Subscribe { collection } => {
                self.subscribe(&collection);
                Ok(self.send(&ServerMessage::Subscribed { collection }))
            }

            ClientMessage::DocSave {
                collection,
                doc_id,
                data,
            } => {
                self.authorize(Action::Write, &collection, &doc_id)?;
                let (version, created) = self
                    .hub
                    .save_document(&collection, &doc_id, self.replica, data)
                    .await?;
                let reply = if created {
                    ServerMessage::DocCreated {
                        collection,
                        doc_id,
                        version,
                    }
                } else {
                    ServerMessage::DocSaved {
                        collection,
                        doc_id,
                        version,
                    }
                };
                Ok(self.send(&reply))
            }

            ClientMessage::DocGet { collection, doc_id } => {
                self.authorize(Action::Read, &collection, &doc_id)?;
                let reply = match self.hub.get_document(&collection, &doc_id).await? {
                    Some((data, version)) => ServerMessage::Doc {
                        collection,
                        doc_id,
                        data,
                        version,
                    },
                    None => ServerMessage::DocNotFound { collection, doc_id },
                };
                Ok(self.send(&reply))
            }

            ClientMessage::Op {
                collection,
                doc_id,
                op,
            } => {
                self.authorize(Action::Write, &collection, &doc_id)?;
                let outcome = self
                    .hub
                    .submit_op(&collection, &doc_id, self.replica, op.clone())
                    .await?;
                Ok(self.send(&ServerMessage::OpAck {
                    op_id: op.id,
                    outcome: outcome_label(outcome).to_owned(),
                }))
            }

            ClientMessage::OpBatch {
                collection,
                doc_id,
                ops,
            } => {
                self.authorize(Action::Write, &collection, &doc_id)?;
                for op in ops {
                    // Each batch member is acked (or rejected) on its own;
                    // one bad operation does not strand the ones after it.
                    let reply = match self
                        .hub
                        .submit_op(&collection, &doc_id, self.replica, op.clone())
                        .await
                    {
                        Ok(outcome) => ServerMessage::OpAck {
                            op_id: op.id,
                            outcome: outcome_label(outcome).to_owned(),
                        },
                        Err(err) => ServerMessage::OpRejected {
                            op_id: op.id,
                            message: err.to_string(),
                        },
                    };
                    if !self.send(&reply) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            ClientMessage::SyncRequest {
                collection,
                doc_id,
                since,
            } => {
                self.authorize(Action::Read, &collection, &doc_id)?;
                let (ops, clock) = self.hub.diff_since(&collection, &doc_id, &since).await;
                Ok(self.send(&ServerMessage::SyncDiff {
                    collection,
                    doc_id,
                    ops,
                    clock,
                }))
            }

            ClientMessage::PresenceJoin {
                collection,
                doc_id,
                user,
            } => {
                self.authorize(Action::Read, &collection, &doc_id)?;
                self.user = Some(user.clone());
                self.subscribe(&collection);

                let key = Hub::doc_key(&collection, &doc_id);
                let users = self.hub.presence.join(&key, self.replica, user);
                let session = users
                    .iter()
                    .find(|s| s.replica == self.replica)
                    .cloned();

                if let Some(session) = session {
                    let joined = ServerMessage::PresenceJoined {
                        collection: collection.clone(),
                        doc_id: doc_id.clone(),
                        session,
                    };
                    self.hub
                        .publish_presence(&collection, &doc_id, self.replica, &joined);
                }
                Ok(self.send(&ServerMessage::PresenceJoinOk {
                    node_id: self.hub.node_id(),
                    users,
                }))
            }

            ClientMessage::PresenceCursor {
                collection,
                doc_id,
                position,
                selection,
            } => {
                let key = Hub::doc_key(&collection, &doc_id);
                if let Some(cursor) =
                    self.hub
                        .presence
                        .update_cursor(&key, self.replica, position, selection)
                {
                    let moved = ServerMessage::PresenceCursorMoved {
                        collection: collection.clone(),
                        doc_id: doc_id.clone(),
                        replica: self.replica,
                        cursor,
                    };
                    self.hub
                        .publish_presence(&collection, &doc_id, self.replica, &moved);
                }
                Ok(true)
            }

            ClientMessage::PresenceUpdate {
                collection,
                doc_id,
                user,
            } => {
                let key = Hub::doc_key(&collection, &doc_id);
                if self.hub.presence.update_user(&key, self.replica, user.clone()) {
                    self.user = Some(user.clone());
                    let updated = ServerMessage::PresenceUpdated {
                        collection: collection.clone(),
                        doc_id: doc_id.clone(),
                        replica: self.replica,
                        user,
                    };
                    self.hub
                        .publish_presence(&collection, &doc_id, self.replica, &updated);
                }
                Ok(true)
            }

            ClientMessage::PresenceGet { collection, doc_id } => {
                let key = Hub::doc_key(&collection, &doc_id);
                let users = self.hub.presence.users(&key);
                Ok(self.send(&ServerMessage::PresenceUsers {
                    count: users.len(),
                    users,
                }))
            }

            ClientMessage::PresenceLeave { collection, doc_id } => {
                let key = Hub::doc_key(&collection, &doc_id);
                if self.hub.presence.leave(&key, self.replica) {
                    let left = ServerMessage::PresenceLeft {
                        collection: collection.clone(),
                        doc_id: doc_id.clone(),
                        replica: self.replica,
                    };
                    self.hub
                        .publish_presence(&collection, &doc_id, self.replica, &left);
                }
                Ok(true)
            }

            ClientMessage::UndoCapture {
                collection,
                doc_id,
                op,
                previous_value,
            } => {
                let key = Hub::doc_key(&collection, &doc_id);
                let handle = self.hub.document(&collection, &doc_id);
                let doc = handle.lock().await;
                let entry = UndoEntry::from_capture(&doc, &op, previous_value);
                drop(doc);

                match entry {
                    Some(entry) => {
                        let state = self.hub.undo.capture(self.replica, &key, entry);
                        Ok(self.send(&ServerMessage::UndoCaptureOk { state }))
                    }
                    None => Err(SyncError::Protocol(
                        "operation kind is not undoable".to_owned(),
                    )),
                }
            }

            ClientMessage::UndoState { collection, doc_id } => {
                let key = Hub::doc_key(&collection, &doc_id);
                let state = self.hub.undo.state(self.replica, &key);
                Ok(self.send(&ServerMessage::UndoState { state }))
            }

            ClientMessage::Undo { collection, doc_id } => {
                self.authorize(Action::Write, &collection, &doc_id)?;
                let key = Hub::doc_key(&collection, &doc_id);
                let handle = self.hub.document(&collection, &doc_id);
                let mut doc = handle.lock().await;
                let undone = self.hub.undo.undo(self.replica, &mut doc)?;
                drop(doc);

                match undone {
                    Some(op) => {
                        self.replicate(&collection, &doc_id, op.clone()).await;
                        let state = self.hub.undo.state(self.replica, &key);
                        Ok(self.send(&ServerMessage::UndoOk { op, state }))
                    }
                    None => Ok(self.send(&ServerMessage::UndoEmpty)),
                }
            }

            ClientMessage::Redo { collection, doc_id } => {
                self.authorize(Action::Write, &collection, &doc_id)?;
                let key = Hub::doc_key(&collection, &doc_id);
                let handle = self.hub.document(&collection, &doc_id);
                let mut doc = handle.lock().await;
                let redone = self.hub.undo.redo(self.replica, &mut doc)?;
                drop(doc);

                match redone {
                    Some(op) => {
                        self.replicate(&collection, &doc_id, op.clone()).await;
                        let state = self.hub.undo.state(self.replica, &key);
                        Ok(self.send(&ServerMessage::RedoOk { op, state }))
                    }
                    None => Ok(self.send(&ServerMessage::RedoEmpty)),
                }
            }

            ClientMessage::Ping { time } => Ok(self.send(&ServerMessage::Pong { time })),
        }
    }

    fn authorize(&self, action: Action, collection: &str, doc_id: &str) -> Result<(), SyncError> {
        self.hub
            .authorize(action, collection, doc_id, self.replica, self.user.clone())
    }

    /// Replicates an operation already applied to the document (undo/redo
    /// path): durable log plus bus fan-out, without re-merging.
    async fn replicate(&self, collection: &str, doc_id: &str, op: Operation) {
        self.hub
            .replicate_applied(collection, doc_id, self.replica, op)
            .await;
    }

    /// Starts the bus fan-out task for a collection, once.
    ///
    /// Operations are collected in a per-document [`OpBatcher`] and leave
    /// as one `op_batch` frame when the size threshold trips or the delay
    /// window elapses. Presence events bypass the batcher.
    fn subscribe(&mut self, collection: &str) {
        if self.subscriptions.contains_key(collection) {
            return;
        }

        let mut rx = self.hub.bus.subscribe(collection);
        let tx = self.tx.clone();
        let replica = self.replica;
        let name = collection.to_owned();
        let max_ops = self.hub.config().batch_max_ops;
        let max_delay = self.hub.config().batch_max_delay;

        let task = tokio::spawn(async move {
            // One batcher per document; ops for different documents never
            // share a frame.
            let mut batchers: HashMap<String, OpBatcher> = HashMap::new();
            let mut ticker =
                tokio::time::interval(max_delay.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if event.from() == replica {
                                continue;
                            }
                            match event {
                                BusEvent::Op { doc_id, op, .. } => {
                                    let batcher = batchers
                                        .entry(doc_id.clone())
                                        .or_insert_with(|| OpBatcher::new(max_ops, max_delay));
                                    if let Some(batch) = batcher.push(op) {
                                        if !send_op_batch(&tx, &name, &doc_id, batch) {
                                            return;
                                        }
                                    }
                                }
                                BusEvent::Presence { payload, .. } => {
                                    match serde_json::to_string(&payload) {
                                        Ok(frame) => {
                                            if tx.send(frame).is_err() {
                                                return;
                                            }
                                        }
                                        Err(err) => {
                                            warn!(error = %err, "failed to encode bus event");
                                        }
                                    }
                                }
                            }
                        }
                        // Ops are recoverable through sync_request and presence
                        // is lossy anyway; a lagged receiver just keeps going.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(replica, skipped, "bus receiver lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        for (doc_id, batcher) in batchers.iter_mut() {
                            if batcher.deadline_due(now)
                                && !send_op_batch(&tx, &name, doc_id, batcher.flush())
                            {
                                return;
                            }
                        }
                    }
                }
            }
            // Channel closed: hand over whatever is still buffered.
            for (doc_id, batcher) in batchers.iter_mut() {
                if !batcher.is_empty() {
                    send_op_batch(&tx, &name, doc_id, batcher.flush());
                }
            }
        });
        self.subscriptions.insert(collection.to_owned(), task);
    }

    fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.tx.send(frame).is_ok(),
            Err(err) => {
                warn!(replica = self.replica, error = %err, "failed to encode reply");
                true
            }
        }
    }
}

fn send_op_batch(
    tx: &mpsc::UnboundedSender<String>,
    collection: &str,
    doc_id: &str,
    ops: Vec<Operation>,
) -> bool {
    if ops.is_empty() {
        return true;
    }
    let message = ServerMessage::OpBatch {
        collection: collection.to_owned(),
        doc_id: doc_id.to_owned(),
        ops,
    };
    match serde_json::to_string(&message) {
        Ok(frame) => tx.send(frame).is_ok(),
        Err(err) => {
            warn!(error = %err, "failed to encode op batch");
            true
        }
    }
}

fn outcome_label(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::Duplicate => "duplicate",
        ApplyOutcome::Buffered => "buffered",
    }
}
