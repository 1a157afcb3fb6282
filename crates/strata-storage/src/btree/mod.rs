//! Immutable B+ trees for LSM disk components.
//!
//! A component file is written once, bottom-up, by [`BulkLoader`] and then
//! only read through [`DiskBTree`]:
//!
//! ```text
//! page 0            metadata (magic, version, root, height, counts, bloom range)
//! pages 1..=L       leaves, left to right, linked by next_leaf
//! pages L+1..       internal levels, lowest level first, root last
//! remaining pages   bloom filter bits (optional)
//! ```
//!
//! Leaf entries are serialized tuples; internal entries are
//! `child:u32 + separator tuple`, where the separator is the first key stored
//! under that child. Every page is sealed with a CRC32 checksum before it is
//! written and verified each time it is pinned for reading.

mod constants;
mod loader;
mod page;
mod tree;
mod types;

pub use constants::{COMPONENT_MAGIC, FORMAT_VERSION, MAX_TUPLE_SIZE, META_PAGE_NUM, NO_PAGE};
pub use loader::BulkLoader;
pub use page::{BTreeInternalPage, BTreeLeafPage};
pub use tree::{DiskBTree, DiskRangeCursor};
pub use types::{seal_page, verify_page, BTreeMeta, InternalPageHeader, LeafPageHeader};
