//! Physical block I/O
//!
//! A [`BlockDevice`] accepts a block payload, reserves space for it, and
//! returns a [`BlockToken`] right away; the payload is written in the
//! background and the completion callback runs exactly once when it is
//! durable (or failed).
//!
//! - [`FileBlockDevice`]: slotted data file served by I/O worker threads
//! - [`MemoryBlockDevice`]: in-memory slots, completes inline

mod bitmap;
mod file;
mod memory;

pub use bitmap::SlotBitmap;
pub use file::{FileBlockDevice, FileDeviceOptions};
pub use memory::MemoryBlockDevice;

use crate::io_account::IoAccount;
use crate::token::{BlockLocation, BlockToken};
use blockio_common::{BlockId, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Runs once when a physical write finished
pub type IoCompletion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Asynchronous block write primitive
pub trait BlockDevice: Send + Sync {
    /// Size of one slot; payloads may not exceed it
    fn block_size(&self) -> u32;

    /// Issue a write and return the token of the new version
    ///
    /// `on_complete` is invoked exactly once, possibly before this returns.
    fn block_write(
        &self,
        data: Bytes,
        block_id: BlockId,
        account: &Arc<IoAccount>,
        on_complete: IoCompletion,
    ) -> Result<BlockToken>;

    /// Read back the payload behind a token, verifying its checksum
    fn block_read(&self, token: &BlockToken, account: &Arc<IoAccount>) -> Result<Bytes>;

    /// Re-mint a token for a location recorded before a restart
    fn adopt(&self, block_id: BlockId, location: BlockLocation, crc32c: u32)
    -> Result<BlockToken>;

    /// Slots not backing any live token
    fn free_blocks(&self) -> u64;
}

/// Device statistics
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub write_errors: AtomicU64,
    pub checksum_errors: AtomicU64,
}
