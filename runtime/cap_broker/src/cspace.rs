//! Capability slot pool
//!
//! Hands out capability indices from a fixed slot range of the process's
//! capability space. Freed slots are reused last-in first-out. A slot is only
//! returned here once the kernel object it named is known to be gone.

use alloc::vec::Vec;
use core::ops::Range;

use l4_platform::CapIdx;

use crate::{CapabilityError, Result};

/// Capability slot in the process's capability space
type CSlot = usize;

/// Allocator for capability slots
#[derive(Debug)]
pub struct CapSlotPool {
    /// First slot of the managed range
    first_slot: CSlot,
    /// Next never-used slot
    next_slot: CSlot,
    /// One past the last slot of the managed range
    max_slots: CSlot,
    /// Free list of released slots
    free_slots: Vec<CSlot>,
}

impl CapSlotPool {
    /// Manage the slots in `range`
    pub fn new(range: Range<usize>) -> Self {
        Self {
            first_slot: range.start,
            next_slot: range.start,
            max_slots: range.end.max(range.start),
            free_slots: Vec::new(),
        }
    }

    /// Take a slot, reusing the most recently released one first
    pub fn allocate(&mut self) -> Result<CapIdx> {
        if let Some(slot) = self.free_slots.pop() {
            log::debug!("cspace: reuse slot {}", slot);
            return Ok(CapIdx::from_slot(slot));
        }

        if self.next_slot >= self.max_slots {
            log::warn!("cspace: out of slots ({} in use)", self.in_use());
            return Err(CapabilityError::OutOfSlots);
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        log::debug!("cspace: allocate slot {}", slot);
        Ok(CapIdx::from_slot(slot))
    }

    /// Give a slot back
    ///
    /// Rejects the invalid handle, slots outside the range or never handed
    /// out, and slots already free.
    pub fn free(&mut self, cap: CapIdx) -> Result<()> {
        if cap.is_invalid() {
            return Err(CapabilityError::InvalidCap);
        }

        let slot = cap.slot();
        if slot < self.first_slot || slot >= self.next_slot || self.free_slots.contains(&slot) {
            log::warn!("cspace: release of slot {} that is not in use", slot);
            return Err(CapabilityError::SlotNotAllocated { slot });
        }

        log::debug!("cspace: release slot {}", slot);
        self.free_slots.push(slot);
        Ok(())
    }

    /// Slots currently handed out
    pub fn in_use(&self) -> usize {
        self.next_slot - self.first_slot - self.free_slots.len()
    }

    /// Slots that can still be handed out
    pub fn available(&self) -> usize {
        self.max_slots - self.next_slot + self.free_slots.len()
    }
}
