//! Test doubles for the write pipeline

use crate::device::{BlockDevice, IoCompletion, MemoryBlockDevice};
use crate::index::{BlockIndex, IndexEntry, MemoryIndex};
use crate::io_account::IoAccount;
use crate::token::{BlockLocation, BlockToken};
use crate::write::IndexWriteOp;
use blockio_common::{BlockId, Error, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness; `RUST_LOG` filters it
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Payload filled with one byte value
pub fn payload(fill: u8, len: usize) -> Bytes {
    Bytes::from(vec![fill; len])
}

#[derive(Default)]
struct GateState {
    issued: Vec<BlockId>,
    pending: Vec<(BlockId, IoCompletion)>,
    fail: HashSet<BlockId>,
    reject: HashSet<BlockId>,
}

/// Device that holds every completion until the test releases it
pub struct GatedDevice {
    inner: MemoryBlockDevice,
    state: Mutex<GateState>,
    issued_cv: Condvar,
}

impl GatedDevice {
    pub fn new(block_size: u32, capacity_blocks: u64) -> Self {
        Self {
            inner: MemoryBlockDevice::new(block_size, capacity_blocks),
            state: Mutex::new(GateState::default()),
            issued_cv: Condvar::new(),
        }
    }

    /// Complete writes of `block_id` with an error
    pub fn fail_block(&self, block_id: BlockId) {
        self.state.lock().fail.insert(block_id);
    }

    /// Refuse to issue writes of `block_id`
    pub fn reject_block(&self, block_id: BlockId) {
        self.state.lock().reject.insert(block_id);
    }

    /// Block ids in the order their writes were issued
    pub fn issued(&self) -> Vec<BlockId> {
        self.state.lock().issued.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Wait until at least `n` completions are held
    pub fn wait_for_pending(&self, n: usize) {
        let mut state = self.state.lock();
        while state.pending.len() < n {
            self.issued_cv.wait(&mut state);
        }
    }

    /// Deliver every held completion in issue order
    pub fn release_all(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let order: Vec<usize> = (0..pending.len()).collect();
        self.deliver(pending, &order);
    }

    /// Deliver held completions in the given order of positions
    pub fn release_in_order(&self, order: &[usize]) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        assert_eq!(order.len(), pending.len(), "order must cover every held write");
        self.deliver(pending, order);
    }

    fn deliver(&self, pending: Vec<(BlockId, IoCompletion)>, order: &[usize]) {
        let fail = self.state.lock().fail.clone();
        let mut slots: Vec<Option<(BlockId, IoCompletion)>> =
            pending.into_iter().map(Some).collect();
        for &i in order {
            let (block_id, on_complete) = slots[i].take().expect("position released twice");
            if fail.contains(&block_id) {
                on_complete(Err(Error::storage(format!("injected failure for {block_id}"))));
            } else {
                on_complete(Ok(()));
            }
        }
    }
}

impl BlockDevice for GatedDevice {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_write(
        &self,
        data: Bytes,
        block_id: BlockId,
        account: &Arc<IoAccount>,
        on_complete: IoCompletion,
    ) -> Result<BlockToken> {
        if self.state.lock().reject.contains(&block_id) {
            return Err(Error::storage(format!("injected rejection for {block_id}")));
        }
        let token = self.inner.issue(data, block_id, account)?;

        let mut state = self.state.lock();
        state.issued.push(block_id);
        state.pending.push((block_id, on_complete));
        self.issued_cv.notify_all();
        Ok(token)
    }

    fn block_read(&self, token: &BlockToken, account: &Arc<IoAccount>) -> Result<Bytes> {
        self.inner.block_read(token, account)
    }

    fn adopt(
        &self,
        block_id: BlockId,
        location: BlockLocation,
        crc32c: u32,
    ) -> Result<BlockToken> {
        self.inner.adopt(block_id, location, crc32c)
    }

    fn free_blocks(&self) -> u64 {
        self.inner.free_blocks()
    }
}

/// Index that records every committed batch
#[derive(Default)]
pub struct RecordingIndex {
    inner: MemoryIndex,
    batches: Mutex<Vec<Vec<IndexWriteOp>>>,
    fail_next: AtomicBool,
    watched: Option<Arc<GatedDevice>>,
    pending_at_commit: Mutex<Vec<usize>>,
}

impl RecordingIndex {
    /// Also note how many writes `device` still holds at each commit
    pub fn watching(device: Arc<GatedDevice>) -> Self {
        Self {
            watched: Some(device),
            ..Self::default()
        }
    }

    /// Make the next commit fail
    pub fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Successfully committed batches, oldest first
    pub fn batches(&self) -> Vec<Vec<IndexWriteOp>> {
        self.batches.lock().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Held completions observed at each commit
    pub fn pending_at_commit(&self) -> Vec<usize> {
        self.pending_at_commit.lock().clone()
    }
}

impl BlockIndex for RecordingIndex {
    fn apply_batch(&self, ops: &[IndexWriteOp]) -> Result<()> {
        if let Some(device) = &self.watched {
            self.pending_at_commit.lock().push(device.pending_count());
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::index_commit("injected commit failure"));
        }
        self.inner.apply_batch(ops)?;
        self.batches.lock().push(ops.to_vec());
        Ok(())
    }

    fn lookup(&self, block_id: BlockId) -> Option<IndexEntry> {
        self.inner.lookup(block_id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.inner.block_ids()
    }
}
