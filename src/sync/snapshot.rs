//! Periodic full-state capture and replay-from-log bootstrap.
//!
//! A snapshot freezes a document's field states together with its vector
//! clock and version. New subscribers restore from the latest snapshot and
//! replay only the log tail after it instead of the full history. Capture
//! runs under the document lock (a consistent marker), but the decision to
//! capture happens in a background pass so live appliers are never blocked
//! waiting on snapshot policy.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::crdt::document::{CrdtDocument, FieldState};
use crate::crdt::operation::Operation;
use crate::crdt::types::{ReplicaId, VectorClock};

/// Frozen document state at a consistent version marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub doc_id: String,
    pub fields: BTreeMap<String, FieldState>,
    pub clock: VectorClock,
    pub version: u64,
}

#[derive(Default)]
struct DocTracking {
    /// Document version at the last capture.
    captured_at: u64,
    /// Latest acknowledged clock per known replica, feeding the low-water mark.
    acks: HashMap<ReplicaId, VectorClock>,
}

/// Snapshot policy and retention bookkeeping for all documents.
pub struct SnapshotManager {
    threshold: usize,
    tracking: Mutex<HashMap<String, DocTracking>>,
}

impl SnapshotManager {
    pub fn new(threshold: usize) -> Self {
        SnapshotManager {
            threshold: threshold.max(1),
            tracking: Mutex::new(HashMap::new()),
        }
    }

    /// Captures a snapshot of the document as it stands right now.
    ///
    /// The caller holds the document lock, so the field states, clock and
    /// version are mutually consistent; operations merged afterwards land
    /// strictly after the captured marker.
    pub fn capture(&self, doc: &CrdtDocument) -> Snapshot {
        let snapshot = Snapshot {
            doc_id: doc.doc_id().to_owned(),
            fields: doc.field_states(),
            clock: doc.state_vector(),
            version: doc.version(),
        };
        self.tracking
            .lock()
            .entry(snapshot.doc_id.clone())
            .or_default()
            .captured_at = snapshot.version;
        tracing::debug!(doc = %snapshot.doc_id, version = snapshot.version, "captured snapshot");
        snapshot
    }

    /// Captures only when the log grown since the last capture exceeds the
    /// configured threshold.
    pub fn maybe_capture(&self, doc: &CrdtDocument) -> Option<Snapshot> {
        let due = {
            let tracking = self.tracking.lock();
            let captured_at = tracking
                .get(doc.doc_id())
                .map(|t| t.captured_at)
                .unwrap_or(0);
            doc.version().saturating_sub(captured_at) as usize >= self.threshold
        };
        due.then(|| self.capture(doc))
    }

    /// Rebuilds a document from a snapshot plus the log tail after it.
    ///
    /// Entries already covered by the snapshot clock are skipped; everything
    /// later goes through the ordinary merge entrypoint, so a tail that
    /// arrives out of order is buffered and drained exactly like live
    /// traffic. A tail entry that fails to merge is skipped with a warning
    /// rather than poisoning the rest of the restore.
    pub fn restore(
        &self,
        snapshot: Snapshot,
        log_tail: Vec<Operation>,
        replica: ReplicaId,
    ) -> CrdtDocument {
        let mut doc = CrdtDocument::from_parts(
            snapshot.doc_id,
            replica,
            snapshot.fields,
            snapshot.clock.clone(),
            snapshot.version,
        );
        for op in log_tail {
            if snapshot.clock.contains(op.id) {
                continue;
            }
            if let Err(err) = doc.merge(op) {
                tracing::warn!(doc = %doc.doc_id(), error = %err, "skipping unreplayable log tail entry");
            }
        }
        doc
    }

    /// Records the state vector a replica has confirmed durable/applied.
    pub fn acknowledge(&self, doc_id: &str, replica: ReplicaId, clock: VectorClock) {
        self.tracking
            .lock()
            .entry(doc_id.to_owned())
            .or_default()
            .acks
            .insert(replica, clock);
    }

    /// The intersection of every known replica's acknowledged clock.
    ///
    /// Log entries covered by this mark have been seen by everyone and are
    /// safe to discard. With no known replicas there is no safe mark and
    /// `None` is returned, never an empty clock.
    pub fn low_water(&self, doc_id: &str) -> Option<VectorClock> {
        let tracking = self.tracking.lock();
        let acks = &tracking.get(doc_id)?.acks;
        let mut clocks = acks.values();
        let first = clocks.next()?.clone();
        Some(clocks.fold(first, |acc, clock| acc.intersect(clock)))
    }

    /// Prunes the document log below the current low-water mark.
    pub fn prune(&self, doc: &mut CrdtDocument) -> usize {
        match self.low_water(doc.doc_id()) {
            Some(mark) => {
                let pruned = doc.prune_log(&mark);
                if pruned > 0 {
                    tracing::debug!(doc = %doc.doc_id(), pruned, "pruned acknowledged log entries");
                }
                pruned
            }
            None => 0,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::document::ApplyOutcome;
    use serde_json::json;

    fn doc_with_edits(n: u64) -> CrdtDocument {
        let mut doc = CrdtDocument::new("notes/1", 1);
        for i in 0..n {
            let op = doc.new_set_op("title", json!(format!("v{i}")));
            doc.apply(op).unwrap();
        }
        doc
    }

    #[test]
    fn test_restore_equals_full_replay() {
        let mut doc = doc_with_edits(3);
        let manager = SnapshotManager::new(10);

        let snapshot = manager.capture(&doc);
        let marker = doc.state_vector();

        let late = doc.new_set_op("title", json!("after"));
        doc.apply(late.clone()).unwrap();

        let restored = manager.restore(snapshot, doc.log_tail(&marker), 2);

        assert_eq!(restored.materialize(), doc.materialize());
        assert_eq!(restored.version(), doc.version());
    }

    #[test]
    fn test_restore_skips_entries_covered_by_snapshot() {
        let mut doc = doc_with_edits(2);
        let manager = SnapshotManager::new(10);
        let snapshot = manager.capture(&doc);
        let version = snapshot.version;

        // Hand the full log back, including covered entries.
        let full_log = doc.diff_since(&VectorClock::new());
        let restored = manager.restore(snapshot, full_log, 2);

        assert_eq!(restored.version(), version);
        assert_eq!(restored.materialize(), doc.materialize());
    }

    #[test]
    fn test_maybe_capture_respects_threshold() {
        let doc = doc_with_edits(3);
        let manager = SnapshotManager::new(5);
        assert!(manager.maybe_capture(&doc).is_none());

        let doc = doc_with_edits(5);
        let snapshot = manager.maybe_capture(&doc);
        assert!(snapshot.is_some());

        // Immediately after a capture the counter resets.
        assert!(manager.maybe_capture(&doc).is_none());
    }

    #[test]
    fn test_low_water_is_what_everyone_acked() {
        let manager = SnapshotManager::new(5);
        assert!(manager.low_water("notes/1").is_none());

        let fast = doc_with_edits(5).state_vector();
        let slow = doc_with_edits(2).state_vector();

        manager.acknowledge("notes/1", 10, fast);
        manager.acknowledge("notes/1", 11, slow);

        let mark = manager.low_water("notes/1").unwrap();
        assert_eq!(mark.seen(1), 2);
    }

    #[test]
    fn test_restore_skips_bad_tail_entry_keeps_rest() {
        let mut doc = doc_with_edits(1);
        let manager = SnapshotManager::new(10);
        let snapshot = manager.capture(&doc);
        let marker = doc.state_vector();

        let good = doc.new_set_op("title", json!("after"));
        doc.apply(good.clone()).unwrap();
        let mut tail = doc.log_tail(&marker);
        // A logged entry that conflicts with the field's kind must not
        // wipe the entries around it.
        tail.insert(
            0,
            Operation::new(
                crate::crdt::types::OpId::new(90, 3),
                "title",
                crate::crdt::operation::OpKind::TextInsert { origin: None, ch: 'x' },
            ),
        );

        let restored = manager.restore(snapshot, tail, 2);
        assert_eq!(restored.materialize()["title"], json!("after"));
    }

    #[test]
    fn test_prune_after_everyone_acked() {
        let mut doc = doc_with_edits(4);
        let manager = SnapshotManager::new(100);

        manager.acknowledge(doc.doc_id(), 10, doc.state_vector());
        manager.acknowledge(doc.doc_id(), 11, doc.state_vector());

        assert_eq!(manager.prune(&mut doc), 4);
        assert_eq!(doc.log_len(), 0);

        // New edits still merge and log normally.
        let op = doc.new_set_op("title", json!("fresh"));
        assert_eq!(doc.apply(op).unwrap(), ApplyOutcome::Applied);
        assert_eq!(doc.log_len(), 1);
    }
}
