//! Free slot tracking for slot-recycling arrays
//!
//! The tree set never moves live entries; removing one leaves a tombstone
//! that the next insert reuses. The set of tombstones is not persisted. It is
//! rebuilt by one scan on first use after open and kept in memory after that.

use std::collections::BTreeSet;

use crate::error::Result;

/// Indices of tombstoned slots in one array
#[derive(Debug, Default)]
pub struct FreeSlots {
    slots: BTreeSet<u64>,
    scanned: bool,
}

impl FreeSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `0..len` once, recording every index `is_free` accepts
    pub fn ensure_scanned(&mut self, len: u64, mut is_free: impl FnMut(u64) -> Result<bool>) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        self.slots.clear();
        for index in 0..len {
            if is_free(index)? {
                self.slots.insert(index);
            }
        }
        self.scanned = true;
        tracing::trace!("free slot scan: {} of {} slots free", self.slots.len(), len);
        Ok(())
    }

    /// Claim the highest free slot
    pub fn take_highest(&mut self) -> Option<u64> {
        self.slots.pop_last()
    }

    pub fn release(&mut self, index: u64) {
        self.slots.insert(index);
    }

    /// Forget a slot (it was popped off the end of the array)
    pub fn remove(&mut self, index: u64) -> bool {
        self.slots.remove(&index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.slots.contains(&index)
    }

    pub fn highest(&self) -> Option<u64> {
        self.slots.last().copied()
    }

    /// Drop everything and rescan on next use
    pub fn invalidate(&mut self) {
        self.slots.clear();
        self.scanned = false;
    }

    /// Empty and known to be empty (after the array was cleared)
    pub fn reset(&mut self) {
        self.slots.clear();
        self.scanned = true;
    }

    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_scanned(&self) -> bool {
        self.scanned
    }
}
