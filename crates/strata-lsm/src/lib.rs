//! LSM indexes for Strata.
//!
//! This crate provides:
//! - Disk components pairing a primary index with a buddy index of tombstones, and a
//!   Memory component holding live tuples and tombstones in one skip list
//! - The harness that flushes, merges and retires components behind atomic list swaps
//! - The merge-with-buddy search cursor with bloom-filter screened tombstone probes
//! - Pluggable merge policies, the operation tracker and the IO scheduler
//! - The JSON manifest that lets an index reopen from its data directory

mod component;
mod cursor;
mod harness;
mod index;
mod manifest;
mod policy;
mod scheduler;
mod tracker;

pub use component::{
    ComponentData, ComponentId, ComponentKind, ComponentMetadata, DiskComponent, LsmComponent,
    MemoryComponent, MemoryEntry,
};
pub use cursor::{CursorStats, LsmSearchCursor};
pub use harness::{ComponentList, CursorInitialState, LsmHarness, SearchLease};
pub use index::{IndexStats, LsmIndex};
pub use manifest::{Manifest, ManifestEntry, MANIFEST_FILE, MANIFEST_VERSION};
pub use policy::{
    create_merge_policy, ConstantMergePolicy, MergePolicy, NoMergePolicy, SizeTieredMergePolicy,
};
pub use scheduler::{IoScheduler, IoTicket};
pub use tracker::{OperationCounts, OperationKind, OperationStats, OperationTracker};
