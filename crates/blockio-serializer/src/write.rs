//! Write descriptors and index operations
//!
//! A [`BlockWrite`] describes one pending mutation of one block. The
//! pipeline consumes a batch of them and produces one [`IndexWriteOp`] per
//! descriptor, in input order.

use crate::token::BlockToken;
use blockio_common::{BlockId, Recency};
use bytes::Bytes;
use std::fmt;

/// Invoked once when a physical write is durable
pub type IoCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked on the issuing context as soon as a write is issued
pub type LaunchCallback<'a> = Box<dyn FnOnce(&BlockToken) + 'a>;

/// Kind of a write descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Update,
    Delete,
    Touch,
}

/// One pending mutation of one block
pub enum BlockWrite<'a> {
    /// Write new contents
    Update {
        block_id: BlockId,
        recency: Recency,
        /// Payload; immutable until the write completes
        data: Bytes,
        io_callback: Option<IoCallback>,
        launch_callback: Option<LaunchCallback<'a>>,
    },
    /// Drop the block from the index; no physical write
    Delete { block_id: BlockId },
    /// Bump the recency only; contents and token are left alone
    Touch { block_id: BlockId, recency: Recency },
}

impl<'a> BlockWrite<'a> {
    #[must_use]
    pub fn update(
        block_id: BlockId,
        recency: Recency,
        data: impl Into<Bytes>,
        io_callback: Option<IoCallback>,
        launch_callback: Option<LaunchCallback<'a>>,
    ) -> Self {
        Self::Update {
            block_id,
            recency,
            data: data.into(),
            io_callback,
            launch_callback,
        }
    }

    #[must_use]
    pub const fn delete(block_id: BlockId) -> Self {
        Self::Delete { block_id }
    }

    #[must_use]
    pub const fn touch(block_id: BlockId, recency: Recency) -> Self {
        Self::Touch { block_id, recency }
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        match self {
            Self::Update { block_id, .. }
            | Self::Delete { block_id }
            | Self::Touch { block_id, .. } => *block_id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> WriteKind {
        match self {
            Self::Update { .. } => WriteKind::Update,
            Self::Delete { .. } => WriteKind::Delete,
            Self::Touch { .. } => WriteKind::Touch,
        }
    }
}

impl fmt::Debug for BlockWrite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update {
                block_id,
                recency,
                data,
                io_callback,
                launch_callback,
            } => f
                .debug_struct("Update")
                .field("block_id", block_id)
                .field("recency", recency)
                .field("len", &data.len())
                .field("io_callback", &io_callback.is_some())
                .field("launch_callback", &launch_callback.is_some())
                .finish(),
            Self::Delete { block_id } => f.debug_struct("Delete").field("block_id", block_id).finish(),
            Self::Touch { block_id, recency } => f
                .debug_struct("Touch")
                .field("block_id", block_id)
                .field("recency", recency)
                .finish(),
        }
    }
}

/// What an index operation does to the block's token
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TokenChange {
    /// Keep whatever token the index holds
    #[default]
    Unchanged,
    /// Remove the token
    Cleared,
    /// Point the block at a new version
    Set(BlockToken),
}

impl TokenChange {
    /// The new token, if this change sets one
    #[must_use]
    pub const fn token(&self) -> Option<&BlockToken> {
        match self {
            Self::Set(token) => Some(token),
            Self::Unchanged | Self::Cleared => None,
        }
    }
}

/// One entry of an atomic index batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexWriteOp {
    pub block_id: BlockId,
    pub token: TokenChange,
    pub recency: Recency,
}

impl IndexWriteOp {
    /// Point `block_id` at a freshly written version
    #[must_use]
    pub const fn set(block_id: BlockId, token: BlockToken, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenChange::Set(token),
            recency,
        }
    }

    /// Remove `block_id` from the index
    #[must_use]
    pub const fn delete(block_id: BlockId) -> Self {
        Self {
            block_id,
            token: TokenChange::Cleared,
            recency: Recency::INVALID,
        }
    }

    /// Change only the recency of `block_id`
    #[must_use]
    pub const fn touch(block_id: BlockId, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenChange::Unchanged,
            recency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::BlockLocation;

    #[test]
    fn test_descriptor_construction() {
        let update = BlockWrite::update(
            BlockId::new(1),
            Recency::new(5),
            Bytes::from_static(b"abc"),
            None,
            None,
        );
        assert_eq!(update.kind(), WriteKind::Update);
        assert_eq!(update.block_id(), BlockId::new(1));

        let delete = BlockWrite::delete(BlockId::new(2));
        assert_eq!(delete.kind(), WriteKind::Delete);
        assert_eq!(delete.block_id(), BlockId::new(2));

        let touch = BlockWrite::touch(BlockId::new(3), Recency::new(9));
        assert_eq!(touch.kind(), WriteKind::Touch);
        assert!(matches!(touch, BlockWrite::Touch { recency, .. } if recency == Recency::new(9)));
    }

    #[test]
    fn test_descriptor_debug_hides_payload() {
        let update = BlockWrite::update(
            BlockId::new(1),
            Recency::new(5),
            vec![0u8; 4096],
            Some(Box::new(|| {})),
            None,
        );
        let text = format!("{update:?}");
        assert!(text.contains("len: 4096"));
        assert!(text.contains("io_callback: true"));
        assert!(text.contains("launch_callback: false"));
    }

    #[test]
    fn test_index_ops() {
        let token = BlockToken::new(BlockId::new(1), BlockLocation::new(0, 3), 0, None);
        let set = IndexWriteOp::set(BlockId::new(1), token.clone(), Recency::new(5));
        assert_eq!(set.token.token(), Some(&token));

        let delete = IndexWriteOp::delete(BlockId::new(2));
        assert_eq!(delete.token, TokenChange::Cleared);
        assert!(!delete.recency.is_valid());

        let touch = IndexWriteOp::touch(BlockId::new(3), Recency::new(9));
        assert_eq!(touch.token, TokenChange::Unchanged);
        assert_eq!(touch.token.token(), None);
    }
}
