//! Block index
//!
//! Maps each block id to its current token and recency. A batch of
//! [`IndexWriteOp`]s is applied atomically: readers see either none or all
//! of it, and a crash never leaves half a batch behind.
//!
//! - [`MemoryIndex`]: volatile map
//! - [`LogIndex`]: map backed by an append-only, checksummed log

mod log;
mod memory;

pub use self::log::LogIndex;
pub use memory::MemoryIndex;

use crate::token::BlockToken;
use crate::write::{IndexWriteOp, TokenChange};
use blockio_common::{BlockId, Recency, Result};
use std::collections::HashMap;

/// Index state of one block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Current version, `None` for a block that was only touched
    pub token: Option<BlockToken>,
    pub recency: Recency,
}

/// Atomic batched index
pub trait BlockIndex: Send + Sync {
    /// Apply all ops, in order, as one atomic commit
    fn apply_batch(&self, ops: &[IndexWriteOp]) -> Result<()>;

    /// Look up a block
    fn lookup(&self, block_id: BlockId) -> Option<IndexEntry>;

    /// Number of blocks present
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all blocks present
    fn block_ids(&self) -> Vec<BlockId>;
}

/// Apply one op to an index map
///
/// Cleared removes the block. Unchanged keeps the token and only moves the
/// recency, creating a token-less entry if the block is absent.
pub(crate) fn apply_op(entries: &mut HashMap<BlockId, IndexEntry>, op: &IndexWriteOp) {
    match &op.token {
        TokenChange::Cleared => {
            entries.remove(&op.block_id);
        }
        TokenChange::Set(token) => {
            entries.insert(
                op.block_id,
                IndexEntry {
                    token: Some(token.clone()),
                    recency: op.recency,
                },
            );
        }
        TokenChange::Unchanged => {
            entries
                .entry(op.block_id)
                .and_modify(|entry| entry.recency = op.recency)
                .or_insert(IndexEntry {
                    token: None,
                    recency: op.recency,
                });
        }
    }
}
