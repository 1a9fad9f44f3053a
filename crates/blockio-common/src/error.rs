//! Error types for BlockIO
//!
//! Contract violations (double completion, waiting from two contexts,
//! entering the pipeline off its home context) are panics and never show up
//! here. Everything below halts the current pipeline invocation; nothing is
//! retried.

use crate::types::BlockId;
use thiserror::Error;

/// Common result type for BlockIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockIO
#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    #[error("no buffer allocator available")]
    AllocatorUnavailable,

    #[error("device is full: {total_blocks} blocks in use")]
    DiskFull { total_blocks: u64 },

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("checksum mismatch for block {block_id}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        block_id: BlockId,
        expected: u32,
        actual: u32,
    },

    #[error("data corruption detected: {0}")]
    Corruption(String),

    // Index errors
    #[error("index commit failed: {0}")]
    IndexCommit(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an index commit error
    pub fn index_commit(msg: impl Into<String>) -> Self {
        Self::IndexCommit(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error came from the physical I/O layer
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::DiskIo(_) | Self::Storage(_))
    }

    /// Check if the engine has no defined degraded mode for this error
    ///
    /// Resource exhaustion and integrity failures leave the engine unable to
    /// continue; a missing block is only fatal to the caller's request.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::BlockNotFound(_) | Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::storage("short write").is_io());
        assert!(Error::DiskIo(std::io::Error::other("boom")).is_io());
        assert!(!Error::AllocatorUnavailable.is_io());

        assert!(Error::AllocatorUnavailable.is_fatal());
        assert!(Error::index_commit("log append failed").is_fatal());
        assert!(!Error::BlockNotFound(BlockId::new(3)).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ChecksumMismatch {
            block_id: BlockId::new(7),
            expected: 0xdead_beef,
            actual: 0x0000_0001,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch for block 7: expected 0xdeadbeef, got 0x00000001"
        );
        assert_eq!(
            Error::DiskFull { total_blocks: 16 }.to_string(),
            "device is full: 16 blocks in use"
        );
    }
}
