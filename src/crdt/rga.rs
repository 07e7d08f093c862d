//! Replicated growable array: the ordered-sequence CRDT behind shared text.
//!
//! Each element records the id of the element it was inserted after (its
//! origin). The total order is derived purely from the origin chain plus a
//! deterministic tie-break among concurrent right-siblings of the same
//! origin, so every replica computes the same order regardless of arrival
//! order. Deletion tombstones elements, it never removes them; tombstones
//! stay addressable as origins for later concurrent inserts.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crdt::types::OpId;

/// One sequence element. `origin == None` anchors at the document head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: OpId,
    pub origin: Option<OpId>,
    pub ch: char,
    pub tombstone: bool,
}

impl Element {
    pub fn new(id: OpId, origin: Option<OpId>, ch: char) -> Self {
        Element {
            id,
            origin,
            ch,
            tombstone: false,
        }
    }
}

/// The sequence itself: elements kept in their converged total order, plus
/// an id index for duplicate and origin lookups.
///
/// Integration requires the origin element to already be present; callers
/// (the document layer) buffer operations whose origin has not arrived yet
/// and retry them, so `Rga` never sees a causal gap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rga {
    elements: Vec<Element>,
    #[serde(skip)]
    ids: HashSet<OpId>,
}

/// Outcome of [`Rga::integrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrated {
    /// The element was placed in the sequence.
    Placed,
    /// The element id was already present; re-delivery is a no-op.
    Duplicate,
    /// The origin has not arrived yet; the caller should buffer and retry.
    MissingOrigin,
}

impl Rga {
    pub fn new() -> Self {
        Rga::default()
    }

    /// Rebuilds the id index after deserialization.
    pub fn reindex(&mut self) {
        self.ids = self.elements.iter().map(|e| e.id).collect();
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.ids.contains(&id)
    }

    fn position(&self, id: OpId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Integrates an insert, local or remote.
    ///
    /// The element is placed after its origin, but behind any already
    /// integrated element with a greater id, so concurrent siblings of one
    /// origin therefore end up in descending id order on every replica.
    /// Skipping greater ids also skips their descendants, because a Lamport
    /// id is always greater than the id of the origin it was created after.
    pub fn integrate(&mut self, element: Element) -> Integrated {
        if self.ids.contains(&element.id) {
            return Integrated::Duplicate;
        }

        let mut pos = match element.origin {
            None => 0,
            Some(origin) => match self.position(origin) {
                Some(p) => p + 1,
                None => return Integrated::MissingOrigin,
            },
        };

        while pos < self.elements.len() && self.elements[pos].id > element.id {
            pos += 1;
        }

        self.ids.insert(element.id);
        self.elements.insert(pos, element);
        Integrated::Placed
    }

    /// Tombstones an element. Returns `false` when the id is unknown;
    /// re-deleting an already tombstoned element is an idempotent no-op.
    pub fn delete(&mut self, id: OpId) -> bool {
        match self.elements.iter_mut().find(|e| e.id == id) {
            Some(element) => {
                element.tombstone = true;
                true
            }
            None => false,
        }
    }

    /// Materialized visible content.
    pub fn to_text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .map(|e| e.ch)
            .collect()
    }

    /// Ids of visible elements in order, for cursor addressing.
    pub fn visible_ids(&self) -> Vec<OpId> {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .map(|e| e.id)
            .collect()
    }

    /// Id of the visible element at `index`, if any.
    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.elements
            .iter()
            .filter(|e| !e.tombstone)
            .nth(index)
            .map(|e| e.id)
    }

    pub fn get(&self, id: OpId) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn visible_len(&self) -> usize {
        self.elements.iter().filter(|e| !e.tombstone).count()
    }

    /// Total element count including tombstones.
    pub fn total_len(&self) -> usize {
        self.elements.len()
    }

    /// All elements including tombstones, in sequence order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::types::LamportClock;

    fn insert(rga: &mut Rga, clock: &LamportClock, origin: Option<OpId>, ch: char) -> OpId {
        let id = clock.tick();
        assert_eq!(rga.integrate(Element::new(id, origin, ch)), Integrated::Placed);
        id
    }

    #[test]
    fn test_sequential_inserts() {
        let clock = LamportClock::new(1);
        let mut rga = Rga::new();

        let a = insert(&mut rga, &clock, None, 'a');
        let b = insert(&mut rga, &clock, Some(a), 'b');
        insert(&mut rga, &clock, Some(b), 'c');

        assert_eq!(rga.to_text(), "abc");
        assert_eq!(rga.visible_len(), 3);
    }

    #[test]
    fn test_delete_tombstones() {
        let clock = LamportClock::new(1);
        let mut rga = Rga::new();

        let a = insert(&mut rga, &clock, None, 'a');
        let b = insert(&mut rga, &clock, Some(a), 'b');
        insert(&mut rga, &clock, Some(b), 'c');

        assert!(rga.delete(b));
        assert_eq!(rga.to_text(), "ac");
        assert_eq!(rga.visible_len(), 2);
        assert_eq!(rga.total_len(), 3);
    }

    #[test]
    fn test_insert_after_tombstone() {
        let clock = LamportClock::new(1);
        let mut rga = Rga::new();

        let a = insert(&mut rga, &clock, None, 'a');
        let b = insert(&mut rga, &clock, Some(a), 'b');
        rga.delete(b);

        insert(&mut rga, &clock, Some(b), 'c');
        assert_eq!(rga.to_text(), "ac");
    }

    #[test]
    fn test_concurrent_siblings_converge() {
        // Two replicas insert at the head concurrently, then exchange.
        let mut left = Rga::new();
        let mut right = Rga::new();

        let x = Element::new(OpId::new(1, 1), None, 'x');
        let y = Element::new(OpId::new(1, 2), None, 'y');

        left.integrate(x);
        left.integrate(y);
        right.integrate(y);
        right.integrate(x);

        assert_eq!(left.to_text(), right.to_text());
        // Higher replica id wins the head position.
        assert_eq!(left.to_text(), "yx");
    }

    #[test]
    fn test_concurrent_runs_do_not_interleave() {
        // Each replica types a run after the same origin; runs must stay
        // contiguous after merge, in descending order of their first id.
        let base = Element::new(OpId::new(1, 1), None, '-');

        let a1 = Element::new(OpId::new(2, 2), Some(base.id), 'a');
        let a2 = Element::new(OpId::new(3, 2), Some(a1.id), 'b');
        let b1 = Element::new(OpId::new(2, 3), Some(base.id), 'c');
        let b2 = Element::new(OpId::new(3, 3), Some(b1.id), 'd');

        let mut one = Rga::new();
        for e in [base, a1, a2, b1, b2] {
            one.integrate(e);
        }

        let mut two = Rga::new();
        for e in [base, b1, b2, a1, a2] {
            two.integrate(e);
        }

        assert_eq!(one.to_text(), two.to_text());
        assert_eq!(one.to_text(), "-cdab");
    }

    #[test]
    fn test_duplicate_integrate_is_noop() {
        let mut rga = Rga::new();
        let e = Element::new(OpId::new(1, 1), None, 'a');

        assert_eq!(rga.integrate(e), Integrated::Placed);
        assert_eq!(rga.integrate(e), Integrated::Duplicate);
        assert_eq!(rga.to_text(), "a");
    }

    #[test]
    fn test_missing_origin_reported() {
        let mut rga = Rga::new();
        let orphan = Element::new(OpId::new(2, 1), Some(OpId::new(1, 1)), 'a');

        assert_eq!(rga.integrate(orphan), Integrated::MissingOrigin);
        assert_eq!(rga.total_len(), 0);
    }

    #[test]
    fn test_id_addressing() {
        let clock = LamportClock::new(1);
        let mut rga = Rga::new();

        let a = insert(&mut rga, &clock, None, 'a');
        let b = insert(&mut rga, &clock, Some(a), 'b');
        rga.delete(a);

        assert_eq!(rga.id_at(0), Some(b));
        assert_eq!(rga.id_at(1), None);
        assert_eq!(rga.visible_ids(), vec![b]);
    }
}
