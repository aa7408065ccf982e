//! Dense slot allocation with a free list.
//!
//! Freed slots are handed out again lowest-first, so slot numbers stay
//! small and allocation is deterministic for a given history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::Slot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotArena {
    /// One past the highest slot ever handed out
    next: Slot,
    free: BTreeSet<Slot>,
}

impl SlotArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free slot, or extend the arena.
    pub fn allocate(&mut self) -> Slot {
        if let Some(slot) = self.free.pop_first() {
            return slot;
        }
        let slot = self.next;
        self.next += 1;
        slot
    }

    /// Claim a specific slot (used when restoring a known layout).
    /// Returns false if the slot is already live.
    pub fn claim(&mut self, slot: Slot) -> bool {
        if slot >= self.next {
            self.free.extend(self.next..slot);
            self.next = slot + 1;
            return true;
        }
        self.free.remove(&slot)
    }

    /// Return a slot to the free list. The caller must already have cleared
    /// every mapping that refers to it.
    pub fn release(&mut self, slot: Slot) -> bool {
        if slot >= self.next {
            return false;
        }
        self.free.insert(slot)
    }

    pub fn is_live(&self, slot: Slot) -> bool {
        slot < self.next && !self.free.contains(&slot)
    }

    pub fn live_count(&self) -> usize {
        self.next as usize - self.free.len()
    }
}
