//! The VFD table (§4.B): a growable array of slots with a freelist.
//! Slot 0 is the sentinel — never allocated, never usable, its `next_free`
//! is the freelist head and its ring links are the ring head/tail.

use tracing::debug;

use crate::slot::Slot;

pub const SENTINEL: usize = 0;
const INITIAL_GROWTH: usize = 32;

pub struct VfdTable {
    pub(crate) slots: Vec<Slot>,
    freelist_head: usize,
}

impl VfdTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(1);
        slots.push(Slot::new_unused()); // slot 0: sentinel
        VfdTable {
            slots,
            freelist_head: SENTINEL,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        false // slot 0 always exists
    }

    /// Grow the table, doubling (minimum `INITIAL_GROWTH`), and link all
    /// new slots onto the freelist head.
    fn grow(&mut self) {
        let old_len = self.slots.len();
        let new_len = (old_len * 2).max(INITIAL_GROWTH);
        debug!(old_len, new_len, "growing VFD table");
        self.slots.reserve(new_len - old_len);
        for i in old_len..new_len {
            let mut s = Slot::new_unused();
            s.next_free = self.freelist_head;
            self.freelist_head = i;
            self.slots.push(s);
        }
    }

    /// Allocate a slot from the freelist head, growing the table first if
    /// the freelist is empty. Returns the slot index; the caller is
    /// responsible for populating `name` etc. before the slot is
    /// considered logically open.
    pub fn alloc(&mut self) -> usize {
        if self.freelist_head == SENTINEL {
            self.grow();
        }
        let idx = self.freelist_head;
        self.freelist_head = self.slots[idx].next_free;
        idx
    }

    /// Reset a slot and push it back onto the freelist head. The caller
    /// must have already released any real descriptor and unlinked the
    /// slot from the LRU ring.
    pub fn free(&mut self, idx: usize) {
        debug_assert_ne!(idx, SENTINEL, "sentinel slot must never be freed");
        self.slots[idx].reset();
        self.slots[idx].next_free = self.freelist_head;
        self.freelist_head = idx;
    }

    pub fn get(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// Number of slots currently on the freelist (diagnostic / test use).
    #[cfg(test)]
    pub fn freelist_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.freelist_head;
        while cur != SENTINEL {
            n += 1;
            cur = self.slots[cur].next_free;
        }
        n
    }
}

impl Default for VfdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_reserved() {
        let t = VfdTable::new();
        assert_eq!(t.len(), 1);
        assert!(t.get(SENTINEL).name.is_none());
    }

    #[test]
    fn alloc_grows_and_links_freelist() {
        let mut t = VfdTable::new();
        let first = t.alloc();
        assert_ne!(first, SENTINEL);
        assert_eq!(t.len(), INITIAL_GROWTH);
        // All the rest should be on the freelist.
        assert_eq!(t.freelist_len(), INITIAL_GROWTH - 2);
    }

    #[test]
    fn free_returns_slot_to_head() {
        let mut t = VfdTable::new();
        let a = t.alloc();
        let b = t.alloc();
        t.free(a);
        let c = t.alloc();
        assert_eq!(c, a, "freed slot should be reused before growing further");
        assert_ne!(b, c);
    }

    #[test]
    fn table_never_shrinks() {
        let mut t = VfdTable::new();
        let mut allocated = Vec::new();
        for _ in 0..40 {
            allocated.push(t.alloc());
        }
        let grown_len = t.len();
        for idx in allocated {
            t.free(idx);
        }
        assert_eq!(t.len(), grown_len);
    }
}
