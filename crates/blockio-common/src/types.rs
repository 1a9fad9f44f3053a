//! Core type definitions for BlockIO
//!
//! Block identifiers, recency timestamps and block size constants shared by
//! the serializer and its collaborators.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default block size: 4 KiB
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest block size accepted by the configuration layer
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Identifier of a logical block
///
/// Stable for the block's lifetime. An identifier is only handed out again
/// after the block was deleted and the delete was committed to the index.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Create a block identifier from its raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The identifier following this one, `None` past `u64::MAX`
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(next) => Some(Self(next)),
            None => None,
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Logical recency of a block version
///
/// Recencies are totally ordered. [`Recency::INVALID`] marks a block that is
/// no longer live and compares greater than every valid recency, so callers
/// must check [`Recency::is_valid`] before comparing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct Recency(u64);

impl Recency {
    /// Marker for deleted blocks
    pub const INVALID: Self = Self(u64::MAX);

    /// Oldest valid recency
    pub const DISTANT_PAST: Self = Self(0);

    /// Create a recency from a raw timestamp
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Get the raw timestamp
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check whether this recency denotes a live block
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// The later of two valid recencies (invalid loses)
    #[must_use]
    pub fn superceding(self, other: Self) -> Self {
        match (self.is_valid(), other.is_valid()) {
            (true, true) => self.max(other),
            (true, false) => self,
            (false, _) => other,
        }
    }
}

impl Default for Recency {
    fn default() -> Self {
        Self::DISTANT_PAST
    }
}

impl fmt::Debug for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Recency({})", self.0)
        } else {
            f.write_str("Recency(invalid)")
        }
    }
}

impl fmt::Display for Recency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}
