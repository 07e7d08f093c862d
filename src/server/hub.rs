//! Shared server state: the document arena and the managers around it.
//!
//! Each document is owned by exactly one entry in the arena and guarded by
//! its own async mutex: operations on one document serialize through it,
//! while different documents proceed fully in parallel. Nothing outside
//! this module reaches into a document's internals directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AccessDecision, Action, EvalContext, RulesEvaluator};
use crate::config::SyncConfig;
use crate::crdt::document::{ApplyOutcome, CrdtDocument};
use crate::crdt::operation::Operation;
use crate::crdt::types::{ReplicaId, VectorClock};
use crate::error::SyncError;
use crate::server::protocol::ServerMessage;
use crate::storage::{log_timestamp, DocumentStore, SyncLogEntry};
use crate::sync::bus::{BusEvent, ReplicationBus};
use crate::sync::presence::PresenceManager;
use crate::sync::snapshot::{Snapshot, SnapshotManager};
use crate::sync::undo::UndoManager;

/// Everything a connection handler needs, shared behind an `Arc`.
pub struct Hub {
    config: SyncConfig,
    node_id: ReplicaId,
    docs: RwLock<HashMap<String, Arc<Mutex<CrdtDocument>>>>,
    latest_snapshots: RwLock<HashMap<String, Snapshot>>,
    pub presence: PresenceManager,
    pub undo: UndoManager,
    pub snapshots: SnapshotManager,
    pub bus: ReplicationBus,
    store: Arc<dyn DocumentStore>,
    rules: Arc<dyn RulesEvaluator>,
    next_replica: AtomicU64,
}

impl Hub {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        rules: Arc<dyn RulesEvaluator>,
    ) -> Arc<Self> {
        // Wall-clock base keeps replica ids distinct across processes.
        let node_id = Utc::now().timestamp_millis() as u64;
        Arc::new(Hub {
            presence: PresenceManager::new(config.presence_ttl),
            undo: UndoManager::new(config.undo_depth),
            snapshots: SnapshotManager::new(config.snapshot_threshold),
            bus: ReplicationBus::new(config.bus_capacity, config.dedup_window),
            latest_snapshots: RwLock::new(HashMap::new()),
            docs: RwLock::new(HashMap::new()),
            store,
            rules,
            node_id,
            next_replica: AtomicU64::new(node_id + 1),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn node_id(&self) -> ReplicaId {
        self.node_id
    }

    /// Issues a fresh replica id for a new session.
    pub fn allocate_replica(&self) -> ReplicaId {
        self.next_replica.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Number of documents currently resident in the arena.
    pub fn document_count(&self) -> usize {
        self.docs.read().len()
    }

    pub fn doc_key(collection: &str, doc_id: &str) -> String {
        format!("{collection}/{doc_id}")
    }

    /// Evaluates the authorization gate for an action on a document path.
    pub fn authorize(
        &self,
        action: Action,
        collection: &str,
        doc_id: &str,
        replica: ReplicaId,
        user: Option<Value>,
    ) -> Result<(), SyncError> {
        let path = Self::doc_key(collection, doc_id);
        let ctx = EvalContext { replica, user };
        match self.rules.evaluate(action, &path, &ctx) {
            AccessDecision { allowed: true, .. } => Ok(()),
            AccessDecision { reason, .. } => Err(SyncError::Denied {
                reason: reason.unwrap_or_else(|| "denied by rules".to_owned()),
            }),
        }
    }

    /// The arena entry for a document, bootstrapping it on first touch.
    ///
    /// Bootstrap prefers the latest snapshot plus the sync-log tail after
    /// it; with no snapshot, the full sync log is replayed.
    pub fn document(&self, collection: &str, doc_id: &str) -> Arc<Mutex<CrdtDocument>> {
        let key = Self::doc_key(collection, doc_id);
        if let Some(doc) = self.docs.read().get(&key) {
            return doc.clone();
        }

        let doc = self.bootstrap(collection, doc_id, &key);
        let mut docs = self.docs.write();
        // Another task may have bootstrapped concurrently; first one wins.
        docs.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(doc)))
            .clone()
    }

    fn bootstrap(&self, collection: &str, doc_id: &str, key: &str) -> CrdtDocument {
        let snapshot = self.latest_snapshots.read().get(key).cloned();
        let logged_ops: Vec<Operation> = match self.store.sync_logs_since(collection, 0) {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| entry.doc_id == doc_id)
                .map(|entry| entry.op)
                .collect(),
            Err(err) => {
                warn!(doc = key, error = %err, "sync log replay unavailable, starting empty");
                Vec::new()
            }
        };

        match snapshot {
            Some(snapshot) => {
                debug!(doc = key, version = snapshot.version, "restoring from snapshot");
                self.snapshots.restore(snapshot, logged_ops, self.node_id)
            }
            None => {
                let mut doc = CrdtDocument::new(key, self.node_id);
                for op in logged_ops {
                    // One bad logged entry must not cost the history
                    // around it.
                    if let Err(err) = doc.merge(op) {
                        warn!(doc = key, error = %err, "skipping unreplayable logged operation");
                    }
                }
                doc
            }
        }
    }

    /// Admits one operation into a document and replicates it.
    ///
    /// The operation has already passed the authorization gate. Applied and
    /// buffered operations are durably logged and published to the bus;
    /// duplicates are suppressed. A persistence failure leaves the
    /// in-memory merge in place and only degrades durability.
    pub async fn submit_op(
        &self,
        collection: &str,
        doc_id: &str,
        from: ReplicaId,
        op: Operation,
    ) -> Result<ApplyOutcome, SyncError> {
        let handle = self.document(collection, doc_id);
        let mut doc = handle.lock().await;

        let outcome = doc.merge(op.clone())?;
        if outcome == ApplyOutcome::Duplicate {
            return Ok(outcome);
        }

        if let Err(err) = self.store.append_sync_log(SyncLogEntry {
            collection: collection.to_owned(),
            doc_id: doc_id.to_owned(),
            op: op.clone(),
            recorded_at: log_timestamp(),
        }) {
            warn!(doc = %doc.doc_id(), error = %err, "durable log append failed, operation kept in memory");
        }

        if let Some(snapshot) = self.snapshots.maybe_capture(&doc) {
            self.latest_snapshots
                .write()
                .insert(Self::doc_key(collection, doc_id), snapshot);
        }
        drop(doc);

        self.bus.mark_seen(op.id);
        self.bus.publish(
            collection,
            BusEvent::Op {
                doc_id: doc_id.to_owned(),
                from,
                op,
            },
        );
        Ok(outcome)
    }

    /// Replicates an operation that is already merged into the document
    /// (the undo/redo path): durable log, snapshot check and bus fan-out,
    /// without re-merging.
    pub async fn replicate_applied(
        &self,
        collection: &str,
        doc_id: &str,
        from: ReplicaId,
        op: Operation,
    ) {
        if let Err(err) = self.store.append_sync_log(SyncLogEntry {
            collection: collection.to_owned(),
            doc_id: doc_id.to_owned(),
            op: op.clone(),
            recorded_at: log_timestamp(),
        }) {
            warn!(doc = doc_id, error = %err, "durable log append failed, operation kept in memory");
        }

        let handle = self.document(collection, doc_id);
        let doc = handle.lock().await;
        if let Some(snapshot) = self.snapshots.maybe_capture(&doc) {
            self.latest_snapshots
                .write()
                .insert(Self::doc_key(collection, doc_id), snapshot);
        }
        drop(doc);

        self.bus.mark_seen(op.id);
        self.bus.publish(
            collection,
            BusEvent::Op {
                doc_id: doc_id.to_owned(),
                from,
                op,
            },
        );
    }

    /// Saves a document's top-level keys as LWW register writes plus a
    /// durable row. Returns the stored version and whether the row was
    /// created.
    pub async fn save_document(
        &self,
        collection: &str,
        doc_id: &str,
        from: ReplicaId,
        data: Value,
    ) -> Result<(u64, bool), SyncError> {
        let fields = match data {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::Protocol(format!(
                    "doc_save data must be an object, got {other}"
                )));
            }
        };

        let handle = self.document(collection, doc_id);
        let mut doc = handle.lock().await;
        let mut ops = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let op = doc.new_set_op(&field, value);
            doc.apply(op.clone())?;
            ops.push(op);
        }
        let materialized = doc.materialize();
        drop(doc);

        for op in ops {
            if let Err(err) = self.store.append_sync_log(SyncLogEntry {
                collection: collection.to_owned(),
                doc_id: doc_id.to_owned(),
                op: op.clone(),
                recorded_at: log_timestamp(),
            }) {
                warn!(doc = doc_id, error = %err, "durable log append failed");
            }
            self.bus.mark_seen(op.id);
            self.bus.publish(
                collection,
                BusEvent::Op {
                    doc_id: doc_id.to_owned(),
                    from,
                    op,
                },
            );
        }

        let (stored, created) = self
            .store
            .save_document(collection, doc_id, materialized, None)?;
        info!(collection, doc = doc_id, version = stored.version, created, "document saved");
        Ok((stored.version, created))
    }

    /// Reader view of a document: live state when the arena has it, the
    /// stored row otherwise.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<(Value, u64)>, SyncError> {
        let key = Self::doc_key(collection, doc_id);
        let live = self.docs.read().get(&key).cloned();
        if let Some(handle) = live {
            let doc = handle.lock().await;
            if doc.version() > 0 {
                let stored_version = self
                    .store
                    .get_document(collection, doc_id)?
                    .map(|row| row.version)
                    .unwrap_or(doc.version());
                return Ok(Some((doc.materialize(), stored_version)));
            }
        }
        Ok(self
            .store
            .get_document(collection, doc_id)?
            .map(|row| (row.data, row.version)))
    }

    /// Operations a lagging replica has not seen, with the clock to resume
    /// from.
    pub async fn diff_since(
        &self,
        collection: &str,
        doc_id: &str,
        since: &VectorClock,
    ) -> (Vec<Operation>, VectorClock) {
        let handle = self.document(collection, doc_id);
        let doc = handle.lock().await;
        (doc.diff_since(since), doc.state_vector())
    }

    /// Publishes a presence event on a collection channel.
    pub fn publish_presence(
        &self,
        collection: &str,
        doc_id: &str,
        from: ReplicaId,
        message: &ServerMessage,
    ) {
        match serde_json::to_value(message) {
            Ok(payload) => self.bus.publish(
                collection,
                BusEvent::Presence {
                    doc_id: doc_id.to_owned(),
                    from,
                    payload,
                },
            ),
            Err(err) => warn!(error = %err, "failed to encode presence event"),
        }
    }

    /// Session teardown: presence leaves everywhere, undo stacks dropped.
    /// Operations the session already submitted stay applied.
    pub fn disconnect(&self, replica: ReplicaId) {
        for key in self.presence.leave_all(replica) {
            if let Some((collection, doc_id)) = key.split_once('/') {
                let message = ServerMessage::PresenceLeft {
                    collection: collection.to_owned(),
                    doc_id: doc_id.to_owned(),
                    replica,
                };
                self.publish_presence(collection, doc_id, replica, &message);
            }
        }
        self.undo.drop_client(replica);
        debug!(replica, "session disconnected");
    }

    /// Background presence sweep: evicts idle sessions and announces the
    /// departures.
    pub fn sweep_presence(&self) {
        for (key, replica) in self.presence.sweep_expired(Utc::now()) {
            if let Some((collection, doc_id)) = key.split_once('/') {
                let message = ServerMessage::PresenceLeft {
                    collection: collection.to_owned(),
                    doc_id: doc_id.to_owned(),
                    replica,
                };
                self.publish_presence(collection, doc_id, replica, &message);
            }
        }
    }
}
