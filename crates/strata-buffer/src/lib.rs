//! Buffer cache for Strata.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size frame pool with configurable page count
//! - Clock eviction over unpinned, unconfiscated frames
//! - RAII pins and per-page read/write latches
//! - Dirty page write-back through a pluggable [`PageStore`]
//! - Frame confiscation for bulk loading

mod frame;
mod pool;
mod replacer;
mod store;

pub use frame::{BufferFrame, FrameId};
pub use pool::{
    BufferCache, BufferCacheStats, CleanerHandle, ConfiscatedPage, PageHandle, PageReadLatch,
    PageWriteLatch,
};
pub use replacer::{ClockReplacer, Replacer};
pub use store::{MemoryPageStore, PageStore};
