//! File-backed block device
//!
//! The data file is divided into `block_size` slots. A write reserves a
//! slot, mints the token, and queues the payload for a pool of I/O worker
//! threads that `pwrite` it (and `fdatasync` when configured) before running
//! the completion callback.

use super::{BlockDevice, DeviceStats, IoCompletion, SlotBitmap};
use crate::io_account::{IoAccount, IoPermit};
use crate::token::{BlockLocation, BlockToken, ReleaseSpace};
use blockio_common::{BlockId, Error, Result, SerializerConfig};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// File device options
#[derive(Clone, Debug)]
pub struct FileDeviceOptions {
    /// Slot size in bytes
    pub block_size: u32,
    /// Number of slots
    pub capacity_blocks: u64,
    /// Number of I/O worker threads
    pub io_threads: usize,
    /// fdatasync each write before completing it
    pub sync_writes: bool,
}

impl Default for FileDeviceOptions {
    fn default() -> Self {
        Self::from_config(&SerializerConfig::default())
    }
}

impl FileDeviceOptions {
    #[must_use]
    pub fn from_config(config: &SerializerConfig) -> Self {
        Self {
            block_size: config.block_size,
            capacity_blocks: config.capacity_blocks,
            io_threads: config.io_threads,
            sync_writes: config.sync_writes,
        }
    }
}

struct WriteRequest {
    offset: u64,
    data: Bytes,
    // Holds the slot until the payload is on disk, so a superseded token
    // cannot hand its slot to a newer write that races this one.
    token: BlockToken,
    permit: IoPermit,
    on_complete: IoCompletion,
}

/// Slotted data file served by background I/O workers
pub struct FileBlockDevice {
    file: Arc<File>,
    path: PathBuf,
    options: FileDeviceOptions,
    slots: Arc<SlotBitmap>,
    stats: Arc<DeviceStats>,
    queue: Option<Sender<WriteRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl FileBlockDevice {
    /// Open or create the data file and start the I/O workers
    ///
    /// All slots start out free; live slots are re-marked through
    /// [`BlockDevice::adopt`] while the index is replayed.
    pub fn open(path: impl AsRef<Path>, options: FileDeviceOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.io_threads == 0 {
            return Err(Error::configuration("io_threads must be at least 1"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {}: {e}", path.display())))?;

        let size = options.capacity_blocks * u64::from(options.block_size);
        if file.metadata()?.len() < size {
            file.set_len(size).map_err(|e| {
                Error::storage(format!("failed to size {}: {e}", path.display()))
            })?;
        }

        let file = Arc::new(file);
        let stats = Arc::new(DeviceStats::default());
        let (tx, rx) = crossbeam_channel::unbounded::<WriteRequest>();

        let mut workers = Vec::with_capacity(options.io_threads);
        for i in 0..options.io_threads {
            let file = Arc::clone(&file);
            let stats = Arc::clone(&stats);
            let rx = rx.clone();
            let sync_writes = options.sync_writes;
            let handle = thread::Builder::new()
                .name(format!("blockio-io-{i}"))
                .spawn(move || worker_loop(&file, &rx, sync_writes, &stats))?;
            workers.push(handle);
        }

        info!(
            "Opened block device {} ({} slots of {} bytes, {} I/O threads)",
            path.display(),
            options.capacity_blocks,
            options.block_size,
            options.io_threads
        );

        Ok(Self {
            file,
            path,
            slots: Arc::new(SlotBitmap::new(options.capacity_blocks, options.block_size)),
            options,
            stats,
            queue: Some(tx),
            workers,
        })
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::storage(format!("sync failed on {}: {e}", self.path.display())))
    }

    fn mint(&self, block_id: BlockId, location: BlockLocation, crc32c: u32) -> BlockToken {
        let releaser: Arc<dyn ReleaseSpace> = self.slots.clone();
        BlockToken::new(block_id, location, crc32c, Some(releaser))
    }
}

fn worker_loop(file: &File, rx: &Receiver<WriteRequest>, sync_writes: bool, stats: &DeviceStats) {
    while let Ok(request) = rx.recv() {
        let WriteRequest {
            offset,
            data,
            token,
            permit,
            on_complete,
        } = request;

        let result = file
            .write_all_at(&data, offset)
            .and_then(|()| if sync_writes { file.sync_data() } else { Ok(()) })
            .map_err(|e| {
                Error::storage(format!(
                    "write of block {} at offset {offset} failed: {e}",
                    token.block_id()
                ))
            });

        match &result {
            Ok(()) => {
                stats.writes.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                stats.write_errors.fetch_add(1, Ordering::Relaxed);
                error!("{}", e);
            }
        }

        drop(permit);
        on_complete(result);
        drop(token);
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u32 {
        self.options.block_size
    }

    fn block_write(
        &self,
        data: Bytes,
        block_id: BlockId,
        account: &Arc<IoAccount>,
        on_complete: IoCompletion,
    ) -> Result<BlockToken> {
        if data.len() > self.options.block_size as usize {
            return Err(Error::storage(format!(
                "block {block_id} payload of {} bytes exceeds block size {}",
                data.len(),
                self.options.block_size
            )));
        }
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Error::internal("block device is shut down"))?;

        let permit = account.acquire();
        let slot = self.slots.allocate()?;
        let location = BlockLocation::new(self.slots.offset_of(slot), data.len() as u32);
        let token = self.mint(block_id, location, crc32c::crc32c(&data));

        debug!(%block_id, slot, len = data.len(), "queueing block write");

        queue
            .send(WriteRequest {
                offset: location.offset,
                data,
                token: token.clone(),
                permit,
                on_complete,
            })
            .map_err(|_| Error::internal("I/O workers exited"))?;

        Ok(token)
    }

    fn block_read(&self, token: &BlockToken, account: &Arc<IoAccount>) -> Result<Bytes> {
        let _permit = account.acquire();

        let mut buf = vec![0u8; token.len()];
        self.file.read_exact_at(&mut buf, token.offset()).map_err(|e| {
            Error::storage(format!(
                "read of block {} at offset {} failed: {e}",
                token.block_id(),
                token.offset()
            ))
        })?;

        let actual = crc32c::crc32c(&buf);
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
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(buf))
    }

    fn adopt(
        &self,
        block_id: BlockId,
        location: BlockLocation,
        crc32c: u32,
    ) -> Result<BlockToken> {
        let block_size = u64::from(self.options.block_size);
        if location.offset % block_size != 0 || location.length > self.options.block_size {
            return Err(Error::Corruption(format!(
                "block {block_id} has invalid location {location:?}"
            )));
        }
        self.slots.mark(self.slots.slot_of(location.offset))?;
        Ok(self.mint(block_id, location, crc32c))
    }

    fn free_blocks(&self) -> u64 {
        self.slots.free_count()
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        // Closing the queue lets the workers drain it and exit
        drop(self.queue.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Closed block device {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::write_cond;
    use crate::io_account::Priority;
    use tempfile::tempdir;

    fn options(capacity_blocks: u64) -> FileDeviceOptions {
        FileDeviceOptions {
            block_size: 4096,
            capacity_blocks,
            io_threads: 2,
            sync_writes: false,
        }
    }

    fn write_and_wait(
        device: &FileBlockDevice,
        account: &Arc<IoAccount>,
        id: u64,
        data: &'static [u8],
    ) -> BlockToken {
        let (completer, cond) = write_cond(None);
        let token = device
            .block_write(
                Bytes::from_static(data),
                BlockId::new(id),
                account,
                completer.into_io_completion(),
            )
            .unwrap();
        cond.wait().unwrap();
        token
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let device = FileBlockDevice::open(dir.path().join("blocks.dat"), options(16)).unwrap();
        let account = Arc::new(IoAccount::new(Priority::Normal));

        let token = write_and_wait(&device, &account, 1, b"hello block");
        assert_eq!(token.block_id(), BlockId::new(1));
        assert_eq!(token.len(), 11);

        let data = device.block_read(&token, &account).unwrap();
        assert_eq!(&data[..], b"hello block");
        assert_eq!(device.stats().writes.load(Ordering::Relaxed), 1);
        assert_eq!(device.free_blocks(), 15);
    }

    #[test]
    fn test_token_drop_frees_slot() {
        let dir = tempdir().unwrap();
        let device = FileBlockDevice::open(dir.path().join("blocks.dat"), options(4)).unwrap();
        let account = Arc::new(IoAccount::default());

        let token = write_and_wait(&device, &account, 1, b"a");
        assert_eq!(device.free_blocks(), 3);
        drop(token);
        assert_eq!(device.free_blocks(), 4);
    }

    #[test]
    fn test_device_full() {
        let dir = tempdir().unwrap();
        let device = FileBlockDevice::open(dir.path().join("blocks.dat"), options(1)).unwrap();
        let account = Arc::new(IoAccount::default());

        let _held = write_and_wait(&device, &account, 1, b"a");
        let err = device
            .block_write(
                Bytes::from_static(b"b"),
                BlockId::new(2),
                &account,
                Box::new(|_| panic!("write was never issued")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DiskFull { .. }));
        assert_eq!(account.outstanding(), 0);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = tempdir().unwrap();
        let device = FileBlockDevice::open(dir.path().join("blocks.dat"), options(4)).unwrap();
        let account = Arc::new(IoAccount::default());

        let err = device
            .block_write(
                Bytes::from(vec![0u8; 4097]),
                BlockId::new(1),
                &account,
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(device.free_blocks(), 4);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let device = FileBlockDevice::open(&path, options(4)).unwrap();
        let account = Arc::new(IoAccount::default());

        let token = write_and_wait(&device, &account, 1, b"checksummed");

        // Corrupt the payload behind the device's back
        let raw = OpenOptions::new().write(true).open(&path).unwrap();
        raw.write_all_at(b"X", token.offset()).unwrap();

        let err = device.block_read(&token, &account).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_adopt_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let account = Arc::new(IoAccount::default());

        let (location, crc) = {
            let device = FileBlockDevice::open(&path, options(8)).unwrap();
            let token = write_and_wait(&device, &account, 7, b"survives restart");
            device.sync().unwrap();
            (token.location(), token.crc32c())
        };

        let device = FileBlockDevice::open(&path, options(8)).unwrap();
        let token = device.adopt(BlockId::new(7), location, crc).unwrap();
        assert_eq!(device.free_blocks(), 7);
        assert_eq!(&device.block_read(&token, &account).unwrap()[..], b"survives restart");

        // A slot can back only one live token
        assert!(device.adopt(BlockId::new(8), location, crc).is_err());
        assert!(
            device
                .adopt(BlockId::new(9), BlockLocation::new(100, 1), 0)
                .is_err()
        );
    }

    #[test]
    fn test_account_limit_respected() {
        let dir = tempdir().unwrap();
        let device = FileBlockDevice::open(dir.path().join("blocks.dat"), options(64)).unwrap();
        let account = Arc::new(IoAccount::with_limit(Priority::Low, 2));

        let mut conds = Vec::new();
        let mut tokens = Vec::new();
        for i in 0..32 {
            let (completer, cond) = write_cond(None);
            tokens.push(
                device
                    .block_write(
                        Bytes::from(vec![i as u8; 512]),
                        BlockId::new(i),
                        &account,
                        completer.into_io_completion(),
                    )
                    .unwrap(),
            );
            assert!(account.outstanding() <= 2);
            conds.push(cond);
        }
        for cond in conds {
            cond.wait().unwrap();
        }
        assert_eq!(account.total_requests(), 32);
        assert_eq!(account.outstanding(), 0);
    }
}
