//! Ephemeral shared awareness: who is here, and where their cursor is.
//!
//! Presence state is purely in-memory, keyed per document and replica, and
//! bounded by a heartbeat TTL. Nothing here touches the operation log or
//! snapshots; a missed cursor update is simply superseded by the next one.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::types::ReplicaId;

/// Cursor position and optional selection inside one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
}

/// One participant's ephemeral session in one document.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceSession {
    pub replica: ReplicaId,
    pub user: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(skip)]
    pub last_heartbeat: DateTime<Utc>,
}

/// Per-document registry of presence sessions with TTL eviction.
pub struct PresenceManager {
    ttl: Duration,
    docs: RwLock<HashMap<String, HashMap<ReplicaId, PresenceSession>>>,
}

impl PresenceManager {
    pub fn new(ttl: std::time::Duration) -> Self {
        PresenceManager {
            ttl: Duration::from_std(ttl).unwrap_or(Duration::seconds(30)),
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or refreshes) a session and returns everyone currently
    /// present in the document, the joiner included.
    pub fn join(&self, doc_id: &str, replica: ReplicaId, user: Value) -> Vec<PresenceSession> {
        let mut docs = self.docs.write();
        let sessions = docs.entry(doc_id.to_owned()).or_default();
        sessions.insert(
            replica,
            PresenceSession {
                replica,
                user,
                cursor: None,
                last_heartbeat: Utc::now(),
            },
        );
        sessions.values().cloned().collect()
    }

    /// Updates a cursor; acts as a heartbeat. Returns the stored cursor, or
    /// `None` when the replica has no session in the document.
    pub fn update_cursor(
        &self,
        doc_id: &str,
        replica: ReplicaId,
        position: Value,
        selection: Option<Value>,
    ) -> Option<CursorState> {
        let mut docs = self.docs.write();
        let session = docs.get_mut(doc_id)?.get_mut(&replica)?;
        let cursor = CursorState { position, selection };
        session.cursor = Some(cursor.clone());
        session.last_heartbeat = Utc::now();
        Some(cursor)
    }

    /// Replaces a session's user metadata; acts as a heartbeat.
    pub fn update_user(&self, doc_id: &str, replica: ReplicaId, user: Value) -> bool {
        let mut docs = self.docs.write();
        match docs.get_mut(doc_id).and_then(|s| s.get_mut(&replica)) {
            Some(session) => {
                session.user = user;
                session.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Removes a session. Returns whether one existed.
    pub fn leave(&self, doc_id: &str, replica: ReplicaId) -> bool {
        let mut docs = self.docs.write();
        match docs.get_mut(doc_id) {
            Some(sessions) => {
                let removed = sessions.remove(&replica).is_some();
                if sessions.is_empty() {
                    docs.remove(doc_id);
                }
                removed
            }
            None => false,
        }
    }

    /// Removes a replica's sessions from every document it joined; used on
    /// disconnect. Returns the affected document ids.
    pub fn leave_all(&self, replica: ReplicaId) -> Vec<String> {
        let mut docs = self.docs.write();
        let mut affected = Vec::new();
        docs.retain(|doc_id, sessions| {
            if sessions.remove(&replica).is_some() {
                affected.push(doc_id.clone());
            }
            !sessions.is_empty()
        });
        affected
    }

    /// Current sessions in a document.
    pub fn users(&self, doc_id: &str) -> Vec<PresenceSession> {
        self.docs
            .read()
            .get(doc_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Evicts sessions whose heartbeat is older than the TTL. Returns the
    /// evicted (document, replica) pairs so callers can broadcast the
    /// departures.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<(String, ReplicaId)> {
        let cutoff = now - self.ttl;
        let mut docs = self.docs.write();
        let mut evicted = Vec::new();
        docs.retain(|doc_id, sessions| {
            sessions.retain(|&replica, session| {
                let live = session.last_heartbeat >= cutoff;
                if !live {
                    evicted.push((doc_id.clone(), replica));
                }
                live
            });
            !sessions.is_empty()
        });
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted expired presence sessions");
        }
        evicted
    }
}
