//! Configuration types for BlockIO
//!
//! Configuration is plain serde data with defaults for every field, so a
//! TOML file only needs to name what it overrides.

use crate::error::{Error, Result};
use crate::types::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for BlockIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serializer configuration
    pub serializer: SerializerConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.serializer.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Serializer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    /// Size of one block in bytes (power of two)
    pub block_size: u32,
    /// Number of slots in the data file
    pub capacity_blocks: u64,
    /// Number of I/O worker threads for the file device
    pub io_threads: usize,
    /// fdatasync after every block write before completing it
    pub sync_writes: bool,
    /// Number of released buffers kept for reuse by the allocator
    pub pool_capacity: usize,
    /// Outstanding request cap for accounts created without an explicit one
    /// (0 = unlimited)
    pub default_max_outstanding: usize,
    /// Directory holding the data file and the index log
    pub data_dir: PathBuf,
    /// Index configuration
    pub index: IndexConfig,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            capacity_blocks: 1 << 20,
            io_threads: 4,
            sync_writes: true,
            pool_capacity: 256,
            default_max_outstanding: 0,
            data_dir: PathBuf::from("/var/lib/blockio"),
            index: IndexConfig::default(),
        }
    }
}

impl SerializerConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Path of the block data file
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.join("blocks.dat")
    }

    /// Path of the index log
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.log")
    }

    /// Reject configurations the serializer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block_size {} must be a power of two >= {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.capacity_blocks == 0 {
            return Err(Error::configuration("capacity_blocks must be at least 1"));
        }
        if self.io_threads == 0 {
            return Err(Error::configuration("io_threads must be at least 1"));
        }
        Ok(())
    }
}

/// Which index implementation backs the serializer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Volatile in-memory index (tests, scratch volumes)
    Memory,
    /// Append-only index log replayed on open
    #[default]
    Log,
}

/// Index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index implementation
    pub kind: IndexKind,
    /// fsync the index log after each committed batch
    pub sync_on_commit: bool,
    /// Rewrite the index log as a snapshot once it grows past this many
    /// bytes (0 = never)
    pub compact_threshold: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::Log,
            sync_on_commit: true,
            compact_threshold: 64 * 1024 * 1024,
        }
    }
}
