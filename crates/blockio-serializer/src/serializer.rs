//! Serializer
//!
//! Owns a block device, a block index and a buffer allocator, and runs the
//! batched write pipeline over them:
//!
//! 1. **Issue**: every update becomes a device write whose token is known
//!    immediately; deletes and touches only produce index ops.
//! 2. **Wait**: block until every issued write completed.
//! 3. **Commit**: apply all index ops as one atomic batch.
//!
//! Pipeline entry points take a [`HomeContext`], which can only be obtained
//! on the thread that created the serializer and cannot leave it.

use crate::buffer::{BufferAllocator, BufferPool, DataBuffer};
use crate::completion::write_cond;
use crate::device::{BlockDevice, FileBlockDevice, FileDeviceOptions};
use crate::fanin::FanIn;
use crate::free_list::BlockIdAllocator;
use crate::index::{BlockIndex, LogIndex, MemoryIndex};
use crate::io_account::{IoAccount, Priority};
use crate::token::BlockToken;
use crate::write::{BlockWrite, IndexWriteOp, IoCallback};
use blockio_common::{BlockId, Error, IndexKind, Recency, Result, SerializerConfig};
use bytes::Bytes;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, error, info};

/// Serializer statistics
#[derive(Debug, Default)]
pub struct SerializerStats {
    /// Committed pipeline batches
    pub batches: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub touches: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Batches that ended without a commit
    pub failed_batches: AtomicU64,
}

/// One write of [`Serializer::block_writes`]
#[derive(Debug, Clone)]
pub struct BlockWriteInfo {
    pub block_id: BlockId,
    pub data: Bytes,
}

impl BlockWriteInfo {
    #[must_use]
    pub fn new(block_id: BlockId, data: impl Into<Bytes>) -> Self {
        Self {
            block_id,
            data: data.into(),
        }
    }
}

/// Proof of running on a serializer's home thread
///
/// Not `Send`, so it cannot be carried to another thread.
pub struct HomeContext<'a> {
    serializer: &'a Serializer,
    _not_send: PhantomData<*const ()>,
}

impl<'a> HomeContext<'a> {
    /// Serializer this context belongs to
    #[must_use]
    pub const fn serializer(&self) -> &'a Serializer {
        self.serializer
    }
}

/// Durable batched block writer
pub struct Serializer {
    config: SerializerConfig,
    home: ThreadId,
    device: Arc<dyn BlockDevice>,
    index: Arc<dyn BlockIndex>,
    allocator: Arc<dyn BufferAllocator>,
    block_ids: Mutex<BlockIdAllocator>,
    stats: SerializerStats,
}

impl Serializer {
    /// Assemble a serializer from explicit collaborators
    ///
    /// The calling thread becomes the serializer's home thread. Ids of all
    /// blocks present in `index` are reserved in the id free list.
    pub fn new(
        config: SerializerConfig,
        device: Arc<dyn BlockDevice>,
        index: Arc<dyn BlockIndex>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        if device.block_size() != config.block_size {
            return Err(Error::configuration(format!(
                "device block size {} does not match configured {}",
                device.block_size(),
                config.block_size
            )));
        }
        if allocator.block_size() != config.block_size as usize {
            return Err(Error::configuration(format!(
                "allocator block size {} does not match configured {}",
                allocator.block_size(),
                config.block_size
            )));
        }

        let mut block_ids = BlockIdAllocator::new();
        for block_id in index.block_ids() {
            block_ids.reserve_block_id(block_id);
        }

        Ok(Self {
            config,
            home: thread::current().id(),
            device,
            index,
            allocator,
            block_ids: Mutex::new(block_ids),
            stats: SerializerStats::default(),
        })
    }

    /// Open the data file and index under `config.data_dir`
    pub fn open(config: SerializerConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::storage(format!(
                "failed to create {}: {e}",
                config.data_dir.display()
            ))
        })?;

        let device = Arc::new(FileBlockDevice::open(
            config.data_path(),
            FileDeviceOptions::from_config(&config),
        )?);

        let index: Arc<dyn BlockIndex> = match config.index.kind {
            IndexKind::Log => Arc::new(
                LogIndex::open(config.index_path(), &*device, config.index.sync_on_commit)?
                    .with_compact_threshold(config.index.compact_threshold),
            ),
            IndexKind::Memory => Arc::new(MemoryIndex::new()),
        };

        let allocator: Arc<dyn BufferAllocator> = Arc::new(BufferPool::new(
            config.block_size as usize,
            config.pool_capacity,
        ));

        let serializer = Self::new(config, device, index, allocator)?;
        info!(
            "Serializer opened at {} ({} blocks in use, {} free slots)",
            serializer.config.data_dir.display(),
            serializer.num_blocks_in_use(),
            serializer.device.free_blocks()
        );
        Ok(serializer)
    }

    /// Get the execution context for pipeline calls
    ///
    /// # Panics
    ///
    /// Panics when called off the home thread.
    #[must_use]
    pub fn home_context(&self) -> HomeContext<'_> {
        assert_eq!(
            thread::current().id(),
            self.home,
            "serializer used off its home thread"
        );
        HomeContext {
            serializer: self,
            _not_send: PhantomData,
        }
    }

    fn check_context(&self, ctx: &HomeContext<'_>) {
        assert!(
            std::ptr::eq(ctx.serializer, self),
            "home context belongs to a different serializer"
        );
    }

    /// Create an account using the configured default cap
    #[must_use]
    pub fn make_io_account(&self, priority: Priority) -> Arc<IoAccount> {
        self.make_io_account_with_limit(priority, self.config.default_max_outstanding)
    }

    /// Create an account with an explicit outstanding request cap (0 = unlimited)
    #[must_use]
    pub fn make_io_account_with_limit(
        &self,
        priority: Priority,
        max_outstanding: usize,
    ) -> Arc<IoAccount> {
        Arc::new(IoAccount::with_limit(priority, max_outstanding))
    }

    /// Allocate a zeroed block buffer
    pub fn malloc(&self) -> Result<DataBuffer> {
        DataBuffer::allocate(&self.allocator)
    }

    /// Allocate a block buffer holding a copy of `other`
    pub fn clone_buf(&self, other: &DataBuffer) -> Result<DataBuffer> {
        DataBuffer::clone_from(&self.allocator, other)
    }

    /// Allocate an unused block id
    pub fn gen_block_id(&self, ctx: &HomeContext<'_>) -> Result<BlockId> {
        self.check_context(ctx);
        self.block_ids
            .lock()
            .gen_block_id()
            .ok_or_else(|| Error::storage("block id space exhausted"))
    }

    /// Number of block ids currently in use
    #[must_use]
    pub fn num_blocks_in_use(&self) -> u64 {
        self.block_ids.lock().num_blocks_in_use()
    }

    /// Apply a batch of writes durably
    ///
    /// Returns once every physical write completed and the index committed
    /// the batch. Index ops keep input order; for repeated block ids the
    /// last descriptor wins.
    ///
    /// If a write cannot be issued, the descriptors after it are dropped
    /// unissued. On any failure the writes already issued are still waited
    /// for, and the index is left untouched.
    ///
    /// Every `io_callback` runs exactly once: when its write completes or
    /// fails, or on the calling thread if the write was never issued.
    pub fn do_writes(
        &self,
        ctx: &HomeContext<'_>,
        writes: Vec<BlockWrite<'_>>,
        account: &Arc<IoAccount>,
    ) -> Result<()> {
        self.check_context(ctx);
        let started = Instant::now();
        let total = writes.len();

        let mut ops = Vec::with_capacity(total);
        let mut conds = Vec::new();
        let mut failure = None;

        let mut writes = writes.into_iter();
        for write in writes.by_ref() {
            match write {
                BlockWrite::Update {
                    block_id,
                    recency,
                    data,
                    io_callback,
                    launch_callback,
                } => {
                    let (completer, cond) = write_cond(io_callback);
                    let len = data.len() as u64;
                    let token = match self.device.block_write(
                        data,
                        block_id,
                        account,
                        completer.into_io_completion(),
                    ) {
                        Ok(token) => token,
                        Err(e) => {
                            error!("Failed to issue write of block {}: {}", block_id, e);
                            failure = Some(e);
                            break;
                        }
                    };

                    if let Some(launch) = launch_callback {
                        launch(&token);
                    }
                    ops.push(IndexWriteOp::set(block_id, token, recency));
                    conds.push(cond);
                    self.stats.updates.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
                }
                BlockWrite::Delete { block_id } => {
                    ops.push(IndexWriteOp::delete(block_id));
                    self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                }
                BlockWrite::Touch { block_id, recency } => {
                    ops.push(IndexWriteOp::touch(block_id, recency));
                    self.stats.touches.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for write in writes {
            if let BlockWrite::Update {
                io_callback: Some(callback),
                ..
            } = write
            {
                callback();
            }
        }

        let issued = conds.len();
        for cond in conds {
            if let Err(e) = cond.wait() {
                error!("Block write failed: {}", e);
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        if let Err(e) = self.index.apply_batch(&ops) {
            error!("Index commit of {} ops failed: {}", ops.len(), e);
            self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.block_ids.lock().apply_committed(&ops);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        debug!(
            ops = total,
            writes = issued,
            elapsed_us = started.elapsed().as_micros() as u64,
            "committed write batch"
        );
        Ok(())
    }

    /// Write one block and wait until it is durable
    ///
    /// The index is not updated.
    pub fn block_write(
        &self,
        ctx: &HomeContext<'_>,
        data: impl Into<Bytes>,
        block_id: BlockId,
        account: &Arc<IoAccount>,
    ) -> Result<BlockToken> {
        self.check_context(ctx);
        let (completer, cond) = write_cond(None);
        let token =
            self.device
                .block_write(data.into(), block_id, account, completer.into_io_completion())?;
        cond.wait()?;
        Ok(token)
    }

    /// Issue several writes; `callback` runs once after all of them complete
    ///
    /// Returns the tokens without waiting. If a write cannot be issued the
    /// error is returned, and `callback` still runs once the writes issued
    /// before it have completed. The index is not updated.
    pub fn block_writes(
        &self,
        ctx: &HomeContext<'_>,
        infos: Vec<BlockWriteInfo>,
        account: &Arc<IoAccount>,
        callback: IoCallback,
    ) -> Result<Vec<BlockToken>> {
        self.check_context(ctx);
        let fanin = FanIn::new(infos.len(), callback);
        let mut unissued = infos.len();
        let mut tokens = Vec::with_capacity(infos.len());

        for info in infos {
            match self
                .device
                .block_write(info.data, info.block_id, account, fanin.io_completion())
            {
                Ok(token) => {
                    tokens.push(token);
                    unissued -= 1;
                }
                Err(e) => {
                    error!("Failed to issue write of block {}: {}", info.block_id, e);
                    for _ in 0..unissued {
                        fanin.complete();
                    }
                    return Err(e);
                }
            }
        }
        Ok(tokens)
    }

    /// Read the payload behind a token
    pub fn block_read(&self, token: &BlockToken, account: &Arc<IoAccount>) -> Result<Bytes> {
        self.device.block_read(token, account)
    }

    /// Current token of a block
    #[must_use]
    pub fn index_read(&self, block_id: BlockId) -> Option<BlockToken> {
        self.index.lookup(block_id).and_then(|entry| entry.token)
    }

    /// Current recency of a block, [`Recency::INVALID`] if absent
    #[must_use]
    pub fn recency(&self, block_id: BlockId) -> Recency {
        self.index
            .lookup(block_id)
            .map_or(Recency::INVALID, |entry| entry.recency)
    }

    /// Get configuration
    #[must_use]
    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &SerializerStats {
        &self.stats
    }

    /// Slots not backing any live token
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.device.free_blocks()
    }
}
