//! The LRU ring (§4.C): a doubly-linked ring over VFD slots that are
//! *physically* open, anchored at slot 0 (the sentinel). Only local
//! slots are ever ring members (spec §3 invariant 2) — DFS slots bypass
//! the ring entirely since "fd pressure" from a remote handle isn't a
//! kernel-descriptor concern.

use crate::table::{VfdTable, SENTINEL};

impl VfdTable {
    /// Unlink `idx` from the ring. No-op on a slot that isn't linked in
    /// (callers only call this on slots they know are ring members).
    pub fn ring_delete(&mut self, idx: usize) {
        let (more, less) = {
            let s = self.get(idx);
            (s.lru_more_recent, s.lru_less_recent)
        };
        self.slots[less].lru_more_recent = more;
        self.slots[more].lru_less_recent = less;
    }

    /// Insert `idx` at the most-recent end of the ring.
    pub fn ring_insert(&mut self, idx: usize) {
        let head_less = self.slots[SENTINEL].lru_less_recent;
        self.slots[idx].lru_more_recent = SENTINEL;
        self.slots[idx].lru_less_recent = head_less;
        self.slots[head_less].lru_more_recent = idx;
        self.slots[SENTINEL].lru_less_recent = idx;
    }

    /// The least-recently-used ring member, or `None` if the ring is empty.
    pub fn ring_lru(&self) -> Option<usize> {
        let candidate = self.slots[SENTINEL].lru_more_recent;
        if candidate == SENTINEL {
            None
        } else {
            Some(candidate)
        }
    }

    /// True if `idx` is already at the most-recent end.
    pub fn ring_is_most_recent(&self, idx: usize) -> bool {
        self.slots[SENTINEL].lru_less_recent == idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_slot(t: &mut VfdTable, name: &str) -> usize {
        let idx = t.alloc();
        t.get_mut(idx).name = Some(name.to_string());
        idx
    }

    #[test]
    fn empty_ring_has_no_lru() {
        let t = VfdTable::new();
        assert_eq!(t.ring_lru(), None);
    }

    #[test]
    fn insert_order_is_preserved_as_recency() {
        let mut t = VfdTable::new();
        let a = open_slot(&mut t, "a");
        let b = open_slot(&mut t, "b");
        let c = open_slot(&mut t, "c");
        t.ring_insert(a);
        t.ring_insert(b);
        t.ring_insert(c);

        // Least recent should be the first one inserted.
        assert_eq!(t.ring_lru(), Some(a));
        assert!(t.ring_is_most_recent(c));
    }

    #[test]
    fn delete_unlinks_and_preserves_order_of_remainder() {
        let mut t = VfdTable::new();
        let a = open_slot(&mut t, "a");
        let b = open_slot(&mut t, "b");
        let c = open_slot(&mut t, "c");
        t.ring_insert(a);
        t.ring_insert(b);
        t.ring_insert(c);

        t.ring_delete(b);
        assert_eq!(t.ring_lru(), Some(a));
        t.ring_delete(a);
        assert_eq!(t.ring_lru(), Some(c));
        assert!(t.ring_is_most_recent(c));
    }

    #[test]
    fn reinsert_moves_to_most_recent_end() {
        let mut t = VfdTable::new();
        let a = open_slot(&mut t, "a");
        let b = open_slot(&mut t, "b");
        t.ring_insert(a);
        t.ring_insert(b);
        assert!(t.ring_is_most_recent(b));

        t.ring_delete(a);
        t.ring_insert(a);
        assert!(t.ring_is_most_recent(a));
        assert_eq!(t.ring_lru(), Some(b));
    }
}
