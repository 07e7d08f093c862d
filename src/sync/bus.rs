//! Cross-process replication bus.
//!
//! One logical broadcast channel per collection carries individual
//! operations and presence events between server processes and between
//! sessions on the same process. Payloads are tagged with their origin so
//! subscribers can skip their own echoes, and operations are deduplicated
//! by id; re-application is idempotent anyway, the window just saves the
//! work.

use std::collections::HashMap;

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::crdt::operation::Operation;
use crate::crdt::types::{OpId, ReplicaId};

/// A replicated event on a collection channel.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A document operation, to be fed through the same merge entrypoint
    /// used for local traffic.
    Op {
        doc_id: String,
        from: ReplicaId,
        op: Operation,
    },
    /// A presence event, forwarded verbatim to subscribers. Best-effort,
    /// unordered, lossy by design.
    Presence {
        doc_id: String,
        from: ReplicaId,
        payload: Value,
    },
}

impl BusEvent {
    pub fn from(&self) -> ReplicaId {
        match self {
            BusEvent::Op { from, .. } | BusEvent::Presence { from, .. } => *from,
        }
    }
}

/// Publish/subscribe fan-out keyed by collection, with an op-id dedup
/// window.
pub struct ReplicationBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    seen: SkipMap<OpId, ()>,
    capacity: usize,
    dedup_window: usize,
}

impl ReplicationBus {
    pub fn new(capacity: usize, dedup_window: usize) -> Self {
        ReplicationBus {
            channels: RwLock::new(HashMap::new()),
            seen: SkipMap::new(),
            capacity: capacity.max(1),
            dedup_window: dedup_window.max(1),
        }
    }

    fn channel(&self, collection: &str) -> broadcast::Sender<BusEvent> {
        if let Some(tx) = self.channels.read().get(collection) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(collection.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribes to a collection's event stream.
    pub fn subscribe(&self, collection: &str) -> broadcast::Receiver<BusEvent> {
        self.channel(collection).subscribe()
    }

    /// Publishes an event. A send with no live subscribers is not an error;
    /// the event simply has no audience right now.
    pub fn publish(&self, collection: &str, event: BusEvent) {
        let _ = self.channel(collection).send(event);
    }

    /// Records an op id in the dedup window. Returns `false` when the id
    /// was already recorded, i.e. this delivery is a duplicate.
    pub fn mark_seen(&self, id: OpId) -> bool {
        if self.seen.contains_key(&id) {
            return false;
        }
        self.seen.insert(id, ());
        while self.seen.len() > self.dedup_window {
            // Oldest ids age out first; documents still dedup via their log.
            if self.seen.pop_front().is_none() {
                break;
            }
        }
        true
    }

    /// Number of collections with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}
