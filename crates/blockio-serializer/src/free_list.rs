//! Block identifier free list
//!
//! Free ids are kept as disjoint inclusive ranges keyed by their first id,
//! starting from one range covering the whole id space. Reserving an
//! arbitrary id splits at most one range, so sparse ids cost one entry each
//! no matter how large they are. The lowest free id is handed out first.

use blockio_common::BlockId;
use std::collections::BTreeMap;

use crate::write::{IndexWriteOp, TokenChange};

/// Hands out block ids and recycles them after committed deletes
#[derive(Debug)]
pub struct BlockIdAllocator {
    /// First free id -> last free id of each range
    free: BTreeMap<u64, u64>,
    in_use: u64,
}

impl Default for BlockIdAllocator {
    fn default() -> Self {
        Self {
            free: BTreeMap::from([(0, u64::MAX)]),
            in_use: 0,
        }
    }
}

impl BlockIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free id, `None` once every id is in use
    pub fn gen_block_id(&mut self) -> Option<BlockId> {
        let (start, last) = self.free.pop_first()?;
        if start < last {
            self.free.insert(start + 1, last);
        }
        self.in_use += 1;
        Some(BlockId::new(start))
    }

    /// Free range holding `id`
    fn range_of(&self, id: BlockId) -> Option<(u64, u64)> {
        self.free
            .range(..=id.get())
            .next_back()
            .filter(|&(_, &last)| last >= id.get())
            .map(|(&start, &last)| (start, last))
    }

    /// Mark an id as used; returns false if it already was
    pub fn reserve_block_id(&mut self, id: BlockId) -> bool {
        let Some((start, last)) = self.range_of(id) else {
            return false;
        };

        let id = id.get();
        self.free.remove(&start);
        if start < id {
            self.free.insert(start, id - 1);
        }
        if id < last {
            self.free.insert(id + 1, last);
        }
        self.in_use += 1;
        true
    }

    /// Recycle an id
    ///
    /// # Panics
    ///
    /// Panics if `id` is not in use.
    pub fn release_block_id(&mut self, id: BlockId) {
        assert!(self.is_in_use(id), "released block id {id} that is not in use");

        let mut start = id.get();
        let mut last = id.get();
        if let Some(prev) = start.checked_sub(1)
            && let Some((prev_start, _)) = self.range_of(BlockId::new(prev))
        {
            self.free.remove(&prev_start);
            start = prev_start;
        }
        if let Some(next) = id.checked_next()
            && let Some(next_last) = self.free.remove(&next.get())
        {
            last = next_last;
        }
        self.free.insert(start, last);
        self.in_use -= 1;
    }

    #[must_use]
    pub fn is_in_use(&self, id: BlockId) -> bool {
        self.range_of(id).is_none()
    }

    #[must_use]
    pub fn num_blocks_in_use(&self) -> u64 {
        self.in_use
    }

    /// Follow a committed index batch
    ///
    /// Deleted blocks give their id back; every other op keeps its block
    /// present in the index, so its id stays reserved.
    pub fn apply_committed(&mut self, ops: &[IndexWriteOp]) {
        for op in ops {
            match op.token {
                TokenChange::Cleared => {
                    if self.is_in_use(op.block_id) {
                        self.release_block_id(op.block_id);
                    }
                }
                TokenChange::Set(_) | TokenChange::Unchanged => {
                    self.reserve_block_id(op.block_id);
                }
            }
        }
    }
}
