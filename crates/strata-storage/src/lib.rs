//! Storage layer for Strata.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O, the buffer cache's backing store
//! - Bulk-loaded, immutable B+ tree component files with range and point cursors
//! - Persistent bloom filters over component keys
//! - The growable identifier list used while building tree levels

mod bloom;
mod btree;
mod disk;
mod freelist;

pub use bloom::{BloomFilter, BLOOM_BYTES_PER_PAGE};
pub use btree::{
    seal_page, verify_page, BTreeInternalPage, BTreeLeafPage, BTreeMeta, BulkLoader, DiskBTree,
    DiskRangeCursor, InternalPageHeader, LeafPageHeader, COMPONENT_MAGIC, FORMAT_VERSION,
    MAX_TUPLE_SIZE, META_PAGE_NUM, NO_PAGE,
};
pub use disk::{DiskManager, DiskManagerConfig};
pub use freelist::LongArrayList;
