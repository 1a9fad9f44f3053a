//! Log-backed block index
//!
//! Every committed batch becomes one checksummed record appended to the
//! index log. On open the log is replayed into memory; a torn record at
//! the tail (crash mid-append) is discarded, so a batch is either fully
//! recovered or not at all. A damaged record with intact records after it
//! is corruption and fails the open.
//!
//! Once the log grows past the compaction threshold it is rewritten as a
//! single snapshot record: the live entries as one batch applied to an
//! empty index.
//!
//! Record format:
//! ```text
//! +--------+------+--------+-----------------+--------+
//! | Magic  | LSN  | Length | bincode ops     | CRC32C |
//! | 4B     | 8B   | 4B     | var             | 4B     |
//! +--------+------+--------+-----------------+--------+
//! ```

use super::{BlockIndex, IndexEntry, apply_op};
use crate::device::BlockDevice;
use crate::token::BlockLocation;
use crate::write::{IndexWriteOp, TokenChange};
use blockio_common::{BlockId, Error, Recency, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Index record magic number
const INDEX_MAGIC: u32 = 0x4249_4458; // "BIDX"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Trailing CRC size
const RECORD_CRC_SIZE: usize = 4;

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(std::array::from_fn(|i| buf[at + i]))
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(std::array::from_fn(|i| buf[at + i]))
}

/// One committed batch
struct IndexRecord {
    lsn: u64,
    data: Vec<u8>,
}

impl IndexRecord {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.data.len() + RECORD_CRC_SIZE);

        buf.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < RECORD_HEADER_SIZE + RECORD_CRC_SIZE {
            return Err(Error::Corruption("index record too small".into()));
        }
        if le_u32(buf, 0) != INDEX_MAGIC {
            return Err(Error::Corruption("invalid index record magic".into()));
        }

        let lsn = le_u64(buf, 4);
        let data_len = le_u32(buf, 12) as usize;
        let total_size = RECORD_HEADER_SIZE + data_len + RECORD_CRC_SIZE;
        if buf.len() < total_size {
            return Err(Error::Corruption("index record truncated".into()));
        }

        let body_end = RECORD_HEADER_SIZE + data_len;
        let stored_crc = le_u32(buf, body_end);
        let computed_crc = crc32c::crc32c(&buf[..body_end]);
        if computed_crc != stored_crc {
            return Err(Error::Corruption("index record CRC mismatch".into()));
        }

        Ok((
            Self {
                lsn,
                data: buf[RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            total_size,
        ))
    }
}

/// Token change as stored in the log
#[derive(Debug, Serialize, Deserialize)]
enum PersistedToken {
    Unchanged,
    Cleared,
    Set { location: BlockLocation, crc32c: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedOp {
    block_id: BlockId,
    token: PersistedToken,
    recency: Recency,
}

impl From<&IndexWriteOp> for PersistedOp {
    fn from(op: &IndexWriteOp) -> Self {
        let token = match &op.token {
            TokenChange::Unchanged => PersistedToken::Unchanged,
            TokenChange::Cleared => PersistedToken::Cleared,
            TokenChange::Set(token) => PersistedToken::Set {
                location: token.location(),
                crc32c: token.crc32c(),
            },
        };
        Self {
            block_id: op.block_id,
            token,
            recency: op.recency,
        }
    }
}

impl PersistedOp {
    /// Op recreating `entry` on an empty index
    fn snapshot(block_id: BlockId, entry: &IndexEntry) -> Self {
        let token = match &entry.token {
            Some(token) => PersistedToken::Set {
                location: token.location(),
                crc32c: token.crc32c(),
            },
            None => PersistedToken::Unchanged,
        };
        Self {
            block_id,
            token,
            recency: entry.recency,
        }
    }
}

/// Block state rebuilt from the log, before tokens are re-minted
struct Recovered {
    location: Option<(BlockLocation, u32)>,
    recency: Recency,
}

struct Replay {
    blocks: HashMap<BlockId, Recovered>,
    valid_len: usize,
    last_lsn: u64,
    batches: u64,
}

fn replay(raw: &[u8]) -> Result<Replay> {
    let mut blocks: HashMap<BlockId, Recovered> = HashMap::new();
    let mut pos = 0;
    let mut last_lsn = 0;
    let mut batches = 0;

    while pos < raw.len() {
        let (record, size) = match IndexRecord::from_bytes(&raw[pos..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                if let Some(next) = next_valid_record(raw, pos + 1) {
                    return Err(Error::Corruption(format!(
                        "damaged index record at offset {pos} ({e}), intact record follows at offset {next}"
                    )));
                }
                // Torn tail
                break;
            }
        };

        let ops: Vec<PersistedOp> = bincode::deserialize(&record.data).map_err(|e| {
            Error::Corruption(format!("undecodable index batch at lsn {}: {e}", record.lsn))
        })?;

        for op in ops {
            match op.token {
                PersistedToken::Cleared => {
                    blocks.remove(&op.block_id);
                }
                PersistedToken::Set { location, crc32c } => {
                    blocks.insert(
                        op.block_id,
                        Recovered {
                            location: Some((location, crc32c)),
                            recency: op.recency,
                        },
                    );
                }
                PersistedToken::Unchanged => {
                    blocks
                        .entry(op.block_id)
                        .and_modify(|block| block.recency = op.recency)
                        .or_insert(Recovered {
                            location: None,
                            recency: op.recency,
                        });
                }
            }
        }

        last_lsn = record.lsn;
        batches += 1;
        pos += size;
    }

    Ok(Replay {
        blocks,
        valid_len: pos,
        last_lsn,
        batches,
    })
}

/// Offset of the first intact record at or after `from`
fn next_valid_record(raw: &[u8], from: usize) -> Option<usize> {
    let magic = INDEX_MAGIC.to_le_bytes();
    let end = raw
        .len()
        .saturating_sub(RECORD_HEADER_SIZE + RECORD_CRC_SIZE - 1);
    (from..end).find(|&at| {
        raw[at..].starts_with(&magic) && IndexRecord::from_bytes(&raw[at..]).is_ok()
    })
}

struct LogWriter {
    file: File,
    /// Length of the log up to the last complete record
    size: u64,
    next_lsn: u64,
    /// Log size that triggers the next compaction
    compact_at: u64,
}

impl LogWriter {
    /// Append one record; a failed append is cut back off the log
    fn append(&mut self, bytes: &[u8], sync: bool) -> io::Result<u64> {
        let result = self
            .file
            .write_all(bytes)
            .and_then(|()| if sync { self.file.sync_data() } else { Ok(()) });

        match result {
            Ok(()) => {
                let lsn = self.next_lsn;
                self.size += bytes.len() as u64;
                self.next_lsn += 1;
                Ok(lsn)
            }
            Err(e) => {
                if let Err(trunc) = self.file.set_len(self.size) {
                    warn!("failed to cut back partial index record: {}", trunc);
                }
                Err(e)
            }
        }
    }
}

/// Durable block index
pub struct LogIndex {
    path: PathBuf,
    entries: RwLock<HashMap<BlockId, IndexEntry>>,
    writer: Mutex<LogWriter>,
    sync_on_commit: bool,
    compact_threshold: u64,
}

impl LogIndex {
    /// Open or create an index log and recover its state
    ///
    /// Locations recorded in the log are re-registered with `device`, which
    /// hands back live tokens for them.
    pub fn open(
        path: impl AsRef<Path>,
        device: &dyn BlockDevice,
        sync_on_commit: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open index log: {e}")))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| Error::storage(format!("failed to read index log: {e}")))?;

        let replay = replay(&raw)?;
        if replay.valid_len < raw.len() {
            warn!(
                "Discarding {} bytes of torn index log tail in {}",
                raw.len() - replay.valid_len,
                path.display()
            );
            file.set_len(replay.valid_len as u64)?;
            file.sync_all()?;
        }

        let mut entries = HashMap::with_capacity(replay.blocks.len());
        for (block_id, block) in replay.blocks {
            let token = match block.location {
                Some((location, crc32c)) => Some(device.adopt(block_id, location, crc32c)?),
                None => None,
            };
            entries.insert(
                block_id,
                IndexEntry {
                    token,
                    recency: block.recency,
                },
            );
        }

        info!(
            "Opened index log {} ({} batches, {} blocks)",
            path.display(),
            replay.batches,
            entries.len()
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: Mutex::new(LogWriter {
                file,
                size: replay.valid_len as u64,
                next_lsn: replay.last_lsn + 1,
                compact_at: 0,
            }),
            sync_on_commit,
            compact_threshold: 0,
        })
    }

    /// Compact once the log reaches `bytes` (0 = never)
    #[must_use]
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self.writer.get_mut().compact_at = bytes;
        self
    }

    /// Rewrite the log as a single snapshot of the current entries
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.compact_locked(&mut writer)
    }

    fn compact_locked(&self, writer: &mut LogWriter) -> Result<()> {
        let mut snapshot: Vec<PersistedOp> = self
            .entries
            .read()
            .iter()
            .map(|(&block_id, entry)| PersistedOp::snapshot(block_id, entry))
            .collect();
        snapshot.sort_by_key(|op| op.block_id);

        let record = IndexRecord {
            lsn: writer.next_lsn.saturating_sub(1),
            data: bincode::serialize(&snapshot)
                .map_err(|e| Error::Serialization(e.to_string()))?,
        };
        let bytes = record.to_bytes();

        let new_path = self.path.with_extension("log.new");
        match std::fs::remove_file(&new_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        // The handle follows the file through the rename
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&new_path)
            .map_err(|e| Error::storage(format!("failed to create index snapshot: {e}")))?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        std::fs::rename(&new_path, &self.path)
            .map_err(|e| Error::storage(format!("index log rename failed: {e}")))?;
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            File::open(dir).and_then(|dir| dir.sync_all())?;
        }

        let before = writer.size;
        writer.file = file;
        writer.size = bytes.len() as u64;
        writer.compact_at = self.compact_threshold.max(writer.size * 2);
        info!(
            "Compacted index log {} from {} to {} bytes ({} blocks)",
            self.path.display(),
            before,
            writer.size,
            snapshot.len()
        );
        Ok(())
    }

    /// Get the path of the log file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current LSN (last committed)
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.writer.lock().next_lsn.saturating_sub(1)
    }

    /// Get current log size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    /// Sync the log to disk
    pub fn sync(&self) -> Result<()> {
        self.writer
            .lock()
            .file
            .sync_all()
            .map_err(|e| Error::storage(format!("index log sync failed: {e}")))
    }
}

impl BlockIndex for LogIndex {
    fn apply_batch(&self, ops: &[IndexWriteOp]) -> Result<()> {
        let persisted: Vec<PersistedOp> = ops.iter().map(PersistedOp::from).collect();
        let data =
            bincode::serialize(&persisted).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut writer = self.writer.lock();
        let record = IndexRecord {
            lsn: writer.next_lsn,
            data,
        };
        let lsn = writer
            .append(&record.to_bytes(), self.sync_on_commit)
            .map_err(|e| Error::index_commit(format!("index log append failed: {e}")))?;

        // Publish while still holding the writer so batches land in log order
        {
            let mut entries = self.entries.write();
            for op in ops {
                apply_op(&mut entries, op);
            }
        }
        debug!(lsn, ops = ops.len(), "committed index batch");

        if self.compact_threshold > 0
            && writer.size >= writer.compact_at
            && let Err(e) = self.compact_locked(&mut writer)
        {
            // The batch is already durable in the uncompacted log
            warn!("Index log compaction failed: {}", e);
        }
        Ok(())
    }

    fn lookup(&self, block_id: BlockId) -> Option<IndexEntry> {
        self.entries.read().get(&block_id).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.entries.read().keys().copied().collect()
    }
}
