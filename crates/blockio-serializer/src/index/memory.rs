//! Volatile in-memory index

use super::{BlockIndex, IndexEntry, apply_op};
use crate::write::IndexWriteOp;
use blockio_common::{BlockId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory block index
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: RwLock<HashMap<BlockId, IndexEntry>>,
}

impl MemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockIndex for MemoryIndex {
    fn apply_batch(&self, ops: &[IndexWriteOp]) -> Result<()> {
        let mut entries = self.entries.write();
        for op in ops {
            apply_op(&mut entries, op);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{BlockLocation, BlockToken};
    use blockio_common::Recency;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_batch_visible_all_at_once() {
        let index = Arc::new(MemoryIndex::new());
        let ops: Vec<_> = (0..64)
            .map(|i| {
                let token = BlockToken::new(BlockId::new(i), BlockLocation::new(i * 512, 1), 0, None);
                IndexWriteOp::set(BlockId::new(i), token, Recency::new(i))
            })
            .collect();

        let reader = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let n = index.len();
                    assert!(n == 0 || n == 64, "observed partial batch of {n}");
                }
            })
        };

        index.apply_batch(&ops).unwrap();
        reader.join().unwrap();

        assert_eq!(index.len(), 64);
        let mut ids = index.block_ids();
        ids.sort();
        assert_eq!(ids.first(), Some(&BlockId::new(0)));
        assert_eq!(ids.last(), Some(&BlockId::new(63)));
    }

    #[test]
    fn test_delete_and_lookup() {
        let index = MemoryIndex::new();
        index
            .apply_batch(&[IndexWriteOp::touch(BlockId::new(7), Recency::new(2))])
            .unwrap();
        assert!(index.lookup(BlockId::new(7)).unwrap().token.is_none());

        index
            .apply_batch(&[IndexWriteOp::delete(BlockId::new(7))])
            .unwrap();
        assert!(index.lookup(BlockId::new(7)).is_none());
        assert!(index.is_empty());
    }
}
