//! Durable storage interface, consumed from the external persistence
//! collaborator.
//!
//! The engine does not define an on-disk format; it talks to storage only
//! through [`DocumentStore`]. [`MemoryStore`] backs the server by default
//! and the test suites. A storage failure never unwinds a merge: in-memory
//! state stays applied, the caller logs a degraded-durability warning and
//! retries the write.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::operation::Operation;
use crate::error::SyncError;

/// A stored document row. `version` is an opaque counter bumped on every
/// accepted write; deletes are soft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
    /// Serialized CRDT state, when the caller chooses to persist it.
    pub crdt_state: Option<Value>,
    #[serde(rename = "_version")]
    pub version: u64,
    pub deleted: bool,
}

/// One appended sync-log row, for since-timestamp operation replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub collection: String,
    pub doc_id: String,
    pub op: Operation,
    /// Milliseconds since the Unix epoch at append time.
    pub recorded_at: i64,
}

/// The persistence surface the engine consumes.
pub trait DocumentStore: Send + Sync {
    fn ensure_collection(&self, name: &str) -> Result<(), SyncError>;

    fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, SyncError>;

    /// Upserts a document, bumping its version. Returns the stored row and
    /// whether it was newly created.
    fn save_document(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        crdt_state: Option<Value>,
    ) -> Result<(StoredDocument, bool), SyncError>;

    /// Soft delete. Returns whether the document existed.
    fn delete_document(&self, collection: &str, id: &str) -> Result<bool, SyncError>;

    fn append_sync_log(&self, entry: SyncLogEntry) -> Result<(), SyncError>;

    /// Log entries for a collection recorded at or after `since_millis`.
    fn sync_logs_since(
        &self,
        collection: &str,
        since_millis: i64,
    ) -> Result<Vec<SyncLogEntry>, SyncError>;
}

/// In-memory [`DocumentStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, StoredDocument>>>,
    logs: RwLock<Vec<SyncLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl DocumentStore for MemoryStore {
    fn ensure_collection(&self, name: &str) -> Result<(), SyncError> {
        self.collections
            .write()
            .entry(name.to_owned())
            .or_default();
        Ok(())
    }

    fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, SyncError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .filter(|doc| !doc.deleted)
            .cloned())
    }

    fn save_document(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        crdt_state: Option<Value>,
    ) -> Result<(StoredDocument, bool), SyncError> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_owned()).or_default();
        match docs.get_mut(id) {
            Some(existing) => {
                existing.data = data;
                existing.crdt_state = crdt_state;
                existing.version += 1;
                let created = existing.deleted;
                existing.deleted = false;
                Ok((existing.clone(), created))
            }
            None => {
                let doc = StoredDocument {
                    id: id.to_owned(),
                    data,
                    crdt_state,
                    version: 1,
                    deleted: false,
                };
                docs.insert(id.to_owned(), doc.clone());
                Ok((doc, true))
            }
        }
    }

    fn delete_document(&self, collection: &str, id: &str) -> Result<bool, SyncError> {
        let mut collections = self.collections.write();
        match collections.get_mut(collection).and_then(|d| d.get_mut(id)) {
            Some(doc) if !doc.deleted => {
                doc.deleted = true;
                doc.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn append_sync_log(&self, entry: SyncLogEntry) -> Result<(), SyncError> {
        self.logs.write().push(entry);
        Ok(())
    }

    fn sync_logs_since(
        &self,
        collection: &str,
        since_millis: i64,
    ) -> Result<Vec<SyncLogEntry>, SyncError> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|entry| entry.collection == collection && entry.recorded_at >= since_millis)
            .cloned()
            .collect())
    }
}

/// Current wall clock in the unit the sync log stores.
pub fn log_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
