//! Block tokens
//!
//! A token names one physical, on-disk version of a block. Tokens are
//! immutable and shared: cloning is a reference count bump, and the space
//! behind a token goes back to its device only when the last clone drops.
//! A token denotes a write that has been issued; durability is signalled
//! separately through the write's completion.

use blockio_common::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Physical location of a block version on its device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Byte offset of the slot
    pub offset: u64,
    /// Number of payload bytes stored in the slot
    pub length: u32,
}

impl BlockLocation {
    #[must_use]
    pub const fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }
}

/// Returns the space behind a dropped token to its owner
pub trait ReleaseSpace: Send + Sync {
    fn release(&self, location: BlockLocation);
}

struct TokenInner {
    block_id: BlockId,
    location: BlockLocation,
    crc32c: u32,
    releaser: Option<Arc<dyn ReleaseSpace>>,
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release(self.location);
        }
    }
}

/// Shared handle to a physical block version
#[derive(Clone)]
pub struct BlockToken {
    inner: Arc<TokenInner>,
}

impl BlockToken {
    /// Mint a token; `releaser` is told when the last clone is dropped
    #[must_use]
    pub fn new(
        block_id: BlockId,
        location: BlockLocation,
        crc32c: u32,
        releaser: Option<Arc<dyn ReleaseSpace>>,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                block_id,
                location,
                crc32c,
                releaser,
            }),
        }
    }

    /// Block the token was written for
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.inner.block_id
    }

    /// Physical location of the payload
    #[must_use]
    pub fn location(&self) -> BlockLocation {
        self.inner.location
    }

    /// Byte offset of the payload
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.inner.location.offset
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.location.length as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.location.length == 0
    }

    /// CRC32C of the payload, checked on read
    #[must_use]
    pub fn crc32c(&self) -> u32 {
        self.inner.crc32c
    }

    /// Number of live handles to this version
    #[must_use]
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both tokens point at the same physical slot
    ///
    /// Unlike `==` this also matches distinct tokens minted for the same
    /// location, e.g. a token adopted during recovery.
    #[must_use]
    pub fn same_location(&self, other: &Self) -> bool {
        self.inner.location == other.inner.location
    }
}

/// Tokens compare by identity
impl PartialEq for BlockToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for BlockToken {}

impl fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockToken")
            .field("block_id", &self.inner.block_id)
            .field("offset", &self.inner.location.offset)
            .field("length", &self.inner.location.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Released(Mutex<Vec<BlockLocation>>);

    impl ReleaseSpace for Released {
        fn release(&self, location: BlockLocation) {
            self.0.lock().push(location);
        }
    }

    #[test]
    fn test_token_identity() {
        let loc = BlockLocation::new(4096, 100);
        let a = BlockToken::new(BlockId::new(1), loc, 7, None);
        let b = a.clone();
        let c = BlockToken::new(BlockId::new(1), loc, 7, None);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.same_location(&c));
        assert_eq!(a.owners(), 2);
        assert_eq!(a.len(), 100);
        assert_eq!(a.offset(), 4096);
    }

    #[test]
    fn test_token_releases_on_last_drop() {
        let released = Arc::new(Released::default());
        let loc = BlockLocation::new(8192, 10);
        let token = BlockToken::new(
            BlockId::new(2),
            loc,
            0,
            Some(Arc::clone(&released) as Arc<dyn ReleaseSpace>),
        );
        let clone = token.clone();

        drop(token);
        assert!(released.0.lock().is_empty());

        drop(clone);
        assert_eq!(*released.0.lock(), vec![loc]);
    }

    #[test]
    fn test_token_shared_across_threads() {
        let token = BlockToken::new(BlockId::new(3), BlockLocation::new(0, 1), 0, None);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = token.clone();
                std::thread::spawn(move || t.block_id())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), BlockId::new(3));
        }
        assert_eq!(token.owners(), 1);
    }
}
