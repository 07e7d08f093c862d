//! Last-write-wins register, map and set CRDTs.
//!
//! All three share one resolution rule: for a given key, the entry with the
//! greater `(wall clock, replica)` stamp wins, compared the same way no
//! matter in which order entries are merged. Deletes are tombstoned entries
//! competing under the same rule, so a later concurrent write resurrects a
//! deleted key. That is the documented semantics, not a bug.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::types::Stamp;

/// One competing write for a key: a value, its stamp, and whether it is a
/// tombstone. The visible entry is always the one with the greatest stamp
/// among all entries ever merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwEntry {
    pub value: Value,
    pub stamp: Stamp,
    pub tombstone: bool,
}

impl LwwEntry {
    pub fn write(value: Value, stamp: Stamp) -> Self {
        LwwEntry {
            value,
            stamp,
            tombstone: false,
        }
    }

    pub fn tombstone(stamp: Stamp) -> Self {
        LwwEntry {
            value: Value::Null,
            stamp,
            tombstone: true,
        }
    }
}

/// Single-value LWW register.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister {
    entry: Option<LwwEntry>,
}

impl LwwRegister {
    pub fn new() -> Self {
        LwwRegister::default()
    }

    /// Visible value; `None` when unset or tombstoned.
    pub fn get(&self) -> Option<&Value> {
        match &self.entry {
            Some(entry) if !entry.tombstone => Some(&entry.value),
            _ => None,
        }
    }

    pub fn set(&mut self, value: Value, stamp: Stamp) -> bool {
        self.merge(LwwEntry::write(value, stamp))
    }

    pub fn clear(&mut self, stamp: Stamp) -> bool {
        self.merge(LwwEntry::tombstone(stamp))
    }

    /// Merges a competing entry. Returns whether the visible state changed.
    ///
    /// Idempotent (re-merging the same entry is a no-op) and commutative
    /// (merge order does not affect the outcome): an incoming entry wins iff
    /// its stamp is strictly greater.
    pub fn merge(&mut self, incoming: LwwEntry) -> bool {
        match &self.entry {
            Some(current) if incoming.stamp <= current.stamp => false,
            _ => {
                self.entry = Some(incoming);
                true
            }
        }
    }

    pub fn entry(&self) -> Option<&LwwEntry> {
        self.entry.as_ref()
    }
}

/// Keyed LWW map; each key resolves independently under the register rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwMap {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwMap {
    pub fn new() -> Self {
        LwwMap::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(entry) if !entry.tombstone => Some(&entry.value),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Value, stamp: Stamp) -> bool {
        self.merge_entry(key, LwwEntry::write(value, stamp))
    }

    pub fn remove(&mut self, key: &str, stamp: Stamp) -> bool {
        self.merge_entry(key, LwwEntry::tombstone(stamp))
    }

    /// Merges a competing entry for `key`; greater stamp wins.
    pub fn merge_entry(&mut self, key: &str, incoming: LwwEntry) -> bool {
        match self.entries.get(key) {
            Some(current) if incoming.stamp <= current.stamp => false,
            _ => {
                self.entries.insert(key.to_owned(), incoming);
                true
            }
        }
    }

    /// Live (non-tombstoned) entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(k, e)| (k.as_str(), &e.value))
    }

    /// All entries including tombstones, for state transfer.
    pub fn raw_entries(&self) -> impl Iterator<Item = (&str, &LwwEntry)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// LWW observed-remove set: membership of each element is an independent
/// add/remove race decided by stamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwSet {
    entries: BTreeMap<String, LwwEntry>,
}

impl LwwSet {
    pub fn new() -> Self {
        LwwSet::default()
    }

    pub fn contains(&self, member: &str) -> bool {
        matches!(self.entries.get(member), Some(entry) if !entry.tombstone)
    }

    pub fn add(&mut self, member: &str, stamp: Stamp) -> bool {
        self.merge_entry(member, LwwEntry::write(Value::Null, stamp))
    }

    pub fn remove(&mut self, member: &str, stamp: Stamp) -> bool {
        self.merge_entry(member, LwwEntry::tombstone(stamp))
    }

    pub fn merge_entry(&mut self, member: &str, incoming: LwwEntry) -> bool {
        match self.entries.get(member) {
            Some(current) if incoming.stamp <= current.stamp => false,
            _ => {
                self.entries.insert(member.to_owned(), incoming);
                true
            }
        }
    }

    /// Live members in lexicographic order.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(m, _)| m.as_str())
    }

    pub fn raw_entries(&self) -> impl Iterator<Item = (&str, &LwwEntry)> {
        self.entries.iter().map(|(m, e)| (m.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.members().count()
    }

    pub fn is_empty(&self) -> bool {
        self.members().next().is_none()
    }
}
