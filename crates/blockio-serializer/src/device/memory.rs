//! In-memory block device
//!
//! Same slot accounting as the file device, but payloads live in a map and
//! every write completes before `block_write` returns.

use super::{BlockDevice, DeviceStats, IoCompletion, SlotBitmap};
use crate::io_account::IoAccount;
use crate::token::{BlockLocation, BlockToken, ReleaseSpace};
use blockio_common::{BlockId, Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Volatile block device
pub struct MemoryBlockDevice {
    block_size: u32,
    slots: Arc<SlotBitmap>,
    /// Payload by slot offset
    blocks: RwLock<HashMap<u64, Bytes>>,
    stats: DeviceStats,
}

impl MemoryBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, capacity_blocks: u64) -> Self {
        Self {
            block_size,
            slots: Arc::new(SlotBitmap::new(capacity_blocks, block_size)),
            blocks: RwLock::new(HashMap::new()),
            stats: DeviceStats::default(),
        }
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Overwrite the stored payload at a location
    #[cfg(test)]
    pub(crate) fn corrupt(&self, location: BlockLocation, data: &'static [u8]) {
        self.blocks
            .write()
            .insert(location.offset, Bytes::from_static(data));
    }

    /// Store a payload and mint its token without running any completion
    pub(crate) fn issue(
        &self,
        data: Bytes,
        block_id: BlockId,
        account: &Arc<IoAccount>,
    ) -> Result<BlockToken> {
        if data.len() > self.block_size as usize {
            return Err(Error::storage(format!(
                "block {block_id} payload of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }

        let _permit = account.acquire();
        let slot = self.slots.allocate()?;
        let location = BlockLocation::new(self.slots.offset_of(slot), data.len() as u32);
        let releaser: Arc<dyn ReleaseSpace> = self.slots.clone();
        let token = BlockToken::new(block_id, location, crc32c::crc32c(&data), Some(releaser));

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.blocks.write().insert(location.offset, data);
        Ok(token)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_write(
        &self,
        data: Bytes,
        block_id: BlockId,
        account: &Arc<IoAccount>,
        on_complete: IoCompletion,
    ) -> Result<BlockToken> {
        let token = self.issue(data, block_id, account)?;
        on_complete(Ok(()));
        Ok(token)
    }

    fn block_read(&self, token: &BlockToken, account: &Arc<IoAccount>) -> Result<Bytes> {
        let _permit = account.acquire();
        let data = self
            .blocks
            .read()
            .get(&token.offset())
            .cloned()
            .ok_or(Error::BlockNotFound(token.block_id()))?;

        let actual = crc32c::crc32c(&data);
        if actual != token.crc32c() {
            self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ChecksumMismatch {
                block_id: token.block_id(),
                expected: token.crc32c(),
                actual,
            });
        }

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    fn adopt(
        &self,
        block_id: BlockId,
        location: BlockLocation,
        crc32c: u32,
    ) -> Result<BlockToken> {
        if !self.blocks.read().contains_key(&location.offset) {
            return Err(Error::Corruption(format!(
                "block {block_id} references empty slot at offset {}",
                location.offset
            )));
        }
        self.slots.mark(self.slots.slot_of(location.offset))?;
        let releaser: Arc<dyn ReleaseSpace> = self.slots.clone();
        Ok(BlockToken::new(block_id, location, crc32c, Some(releaser)))
    }

    fn free_blocks(&self) -> u64 {
        self.slots.free_count()
    }
}
