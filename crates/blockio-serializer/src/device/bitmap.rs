//! Slot allocation bitmap
//!
//! Uses one bit per slot: 0 = free, 1 = backing a live token. Tokens hand
//! their slot back through [`ReleaseSpace`] when the last clone drops.

use crate::token::{BlockLocation, ReleaseSpace};
use blockio_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Free-space bitmap over fixed-size slots
pub struct SlotBitmap {
    /// Bitmap data
    data: Mutex<Vec<u8>>,
    /// Total number of slots
    total_slots: u64,
    /// Slot size in bytes
    slot_size: u64,
    /// Number of free slots (cached)
    free_slots: AtomicU64,
    /// Hint for next free slot search
    search_hint: AtomicU64,
}

impl SlotBitmap {
    /// Create a bitmap with every slot free
    #[must_use]
    pub fn new(total_slots: u64, slot_size: u32) -> Self {
        let bytes_needed = usize::try_from(total_slots.div_ceil(8)).unwrap_or(usize::MAX);
        Self {
            data: Mutex::new(vec![0u8; bytes_needed]),
            total_slots,
            slot_size: u64::from(slot_size),
            free_slots: AtomicU64::new(total_slots),
            search_hint: AtomicU64::new(0),
        }
    }

    fn is_set(data: &[u8], slot: u64) -> bool {
        data[(slot / 8) as usize] & (1 << (slot % 8)) != 0
    }

    fn set(data: &mut [u8], slot: u64) {
        data[(slot / 8) as usize] |= 1 << (slot % 8);
    }

    fn clear(data: &mut [u8], slot: u64) {
        data[(slot / 8) as usize] &= !(1 << (slot % 8));
    }

    /// Byte offset of a slot
    #[must_use]
    pub const fn offset_of(&self, slot: u64) -> u64 {
        slot * self.slot_size
    }

    /// Slot containing a byte offset
    #[must_use]
    pub const fn slot_of(&self, offset: u64) -> u64 {
        offset / self.slot_size
    }

    /// Allocate a single slot
    pub fn allocate(&self) -> Result<u64> {
        let mut data = self.data.lock();
        let hint = self.search_hint.load(Ordering::Relaxed);

        let found = (hint..self.total_slots)
            .chain(0..hint.min(self.total_slots))
            .find(|&slot| !Self::is_set(&data, slot));

        match found {
            Some(slot) => {
                Self::set(&mut data, slot);
                self.free_slots.fetch_sub(1, Ordering::Relaxed);
                self.search_hint.store(slot + 1, Ordering::Relaxed);
                Ok(slot)
            }
            None => Err(Error::DiskFull {
                total_blocks: self.total_slots,
            }),
        }
    }

    /// Mark a specific slot used (recovery)
    pub fn mark(&self, slot: u64) -> Result<()> {
        if slot >= self.total_slots {
            return Err(Error::Corruption(format!(
                "slot {} out of range (max {})",
                slot, self.total_slots
            )));
        }

        let mut data = self.data.lock();
        if Self::is_set(&data, slot) {
            return Err(Error::Corruption(format!("slot {slot} referenced twice")));
        }
        Self::set(&mut data, slot);
        self.free_slots.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Free a single slot
    pub fn free(&self, slot: u64) -> Result<()> {
        if slot >= self.total_slots {
            return Err(Error::storage(format!(
                "slot {} out of range (max {})",
                slot, self.total_slots
            )));
        }

        let mut data = self.data.lock();
        if !Self::is_set(&data, slot) {
            return Err(Error::storage(format!("slot {slot} is not allocated")));
        }

        Self::clear(&mut data, slot);
        self.free_slots.fetch_add(1, Ordering::Relaxed);

        // Prefer low slots for the next allocation
        if slot < self.search_hint.load(Ordering::Relaxed) {
            self.search_hint.store(slot, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Check if a slot is allocated
    #[must_use]
    pub fn is_allocated(&self, slot: u64) -> bool {
        if slot >= self.total_slots {
            return true; // Out of range slots are considered allocated
        }
        Self::is_set(&self.data.lock(), slot)
    }

    /// Get the number of free slots
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free_slots.load(Ordering::Relaxed)
    }

    /// Get the total number of slots
    #[must_use]
    pub const fn total_count(&self) -> u64 {
        self.total_slots
    }
}

impl ReleaseSpace for SlotBitmap {
    fn release(&self, location: BlockLocation) {
        let slot = self.slot_of(location.offset);
        if let Err(e) = self.free(slot) {
            warn!("failed to release slot {}: {}", slot, e);
        }
    }
}
