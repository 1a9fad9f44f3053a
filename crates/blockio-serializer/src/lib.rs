//! BlockIO Serializer - durable batched block writes
//!
//! This crate turns a batch of logical block mutations into asynchronous
//! physical writes plus one atomic index commit:
//! - Block tokens naming the physical version of a block
//! - IO accounts threaded through every request
//! - Exclusively owned data buffers from a pooled allocator
//! - One-shot completion synchronizers and fan-in aggregation
//! - The three-phase write pipeline (issue, wait, commit)
//! - Reference devices (file-backed, in-memory) and indexes (log, memory)
//!
//! # Write Path
//!
//! ```text
//!  BlockWrite batch
//!        │
//!  ┌─────▼──────────────┐  Update ──► device.block_write ──► I/O workers
//!  │ 1. issue           │  Delete ──► {id, cleared, invalid}      │
//!  │                    │  Touch  ──► {id, unchanged, recency}    │
//!  └─────┬──────────────┘                                         │
//!  ┌─────▼──────────────┐                                         │
//!  │ 2. wait            │◄──────── WriteCond ◄── WriteCompleter ◄─┘
//!  └─────┬──────────────┘
//!  ┌─────▼──────────────┐
//!  │ 3. commit          │──► index.apply_batch(ops)   (atomic)
//!  └────────────────────┘
//! ```
//!
//! The index never references a block whose write has not completed: after
//! a crash it points either at the old token or at the fully written new one.

pub mod buffer;
pub mod completion;
pub mod device;
pub mod fanin;
pub mod free_list;
pub mod index;
pub mod io_account;
pub mod serializer;
pub mod token;
pub mod write;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use buffer::{BufferAllocator, BufferPool, DataBuffer};
pub use completion::{WriteCompleter, WriteCond, write_cond};
pub use device::{
    BlockDevice, DeviceStats, FileBlockDevice, FileDeviceOptions, IoCompletion, MemoryBlockDevice,
};
pub use fanin::FanIn;
pub use free_list::BlockIdAllocator;
pub use index::{BlockIndex, IndexEntry, LogIndex, MemoryIndex};
pub use io_account::{IoAccount, IoPermit, Priority};
pub use serializer::{BlockWriteInfo, HomeContext, Serializer, SerializerStats};
pub use token::{BlockLocation, BlockToken, ReleaseSpace};
pub use write::{BlockWrite, IndexWriteOp, IoCallback, LaunchCallback, TokenChange, WriteKind};
