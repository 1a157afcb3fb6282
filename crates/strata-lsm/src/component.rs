//! LSM components.
//!
//! A component is either the in-memory write buffer or an immutable pair of
//! disk B+trees. A disk component keeps live tuples in its primary tree and
//! tombstone keys (key projections of deleted tuples) in its buddy tree. The
//! memory component keeps both in one skip list.

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use strata_common::{MultiComparator, RangePredicate, Tuple};
use strata_storage::DiskBTree;

/// Unique component identifier. Recency is defined by list position, not by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Component variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Memory,
    Disk,
}

/// What a merge policy sees of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub size_bytes: u64,
    pub tuple_count: u64,
    pub tombstone_count: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Memory component
// =============================================================================

/// Skip list key ordered by the index comparator.
#[derive(Clone)]
pub(crate) struct OrderedKey {
    tuple: Tuple,
    comparator: Arc<MultiComparator>,
}

impl OrderedKey {
    pub(crate) fn new(tuple: Tuple, comparator: &Arc<MultiComparator>) -> Self {
        Self {
            tuple,
            comparator: Arc::clone(comparator),
        }
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.comparator.compare(&self.tuple, &other.tuple)
    }
}

/// Skip list key: the index key plus a write version, newest version first.
///
/// A write never replaces a node, it links a newer version in front of the
/// old one, so a reader always finds either the previous or the new entry.
#[derive(Clone)]
pub(crate) struct VersionedKey {
    key: OrderedKey,
    version: u64,
}

impl VersionedKey {
    fn newest(key: OrderedKey) -> Self {
        Self {
            key,
            version: u64::MAX,
        }
    }

    fn oldest(key: OrderedKey) -> Self {
        Self { key, version: 0 }
    }
}

impl PartialEq for VersionedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for VersionedKey {}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.version.cmp(&self.version))
    }
}

/// Newest state of one key in a Memory component.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEntry {
    Live(Tuple),
    /// Key projection of a deleted tuple.
    Tombstone(Tuple),
}

impl MemoryEntry {
    /// The stored tuple, or the key for a tombstone.
    pub fn tuple(&self) -> &Tuple {
        match self {
            MemoryEntry::Live(tuple) | MemoryEntry::Tombstone(tuple) => tuple,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, MemoryEntry::Tombstone(_))
    }
}

pub(crate) type MemoryMap = SkipMap<VersionedKey, MemoryEntry>;

/// Mutable in-memory component over one concurrent skip list.
///
/// Live tuples and tombstones share the list, so the newest version of a key
/// decides its visibility in a single lookup. Superseded versions stay until
/// the component is flushed.
pub struct MemoryComponent {
    comparator: Arc<MultiComparator>,
    entries: Arc<MemoryMap>,
    next_version: AtomicU64,
    approximate_bytes: AtomicUsize,
    sealed: AtomicBool,
}

impl MemoryComponent {
    pub fn new(comparator: Arc<MultiComparator>) -> Self {
        Self {
            comparator,
            entries: Arc::new(SkipMap::new()),
            next_version: AtomicU64::new(1),
            approximate_bytes: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    fn ordered(&self, tuple: &Tuple) -> OrderedKey {
        OrderedKey::new(
            tuple.key(self.comparator.key_field_count()),
            &self.comparator,
        )
    }

    fn write(&self, key: OrderedKey, entry: MemoryEntry) {
        let version = self.next_version.fetch_add(1, Ordering::AcqRel);
        let bytes = key.tuple.encoded_len()
            + match &entry {
                MemoryEntry::Live(tuple) => tuple.encoded_len(),
                MemoryEntry::Tombstone(_) => 0,
            };
        self.approximate_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.entries.insert(VersionedKey { key, version }, entry);
    }

    /// Inserts or replaces the tuple with the same key.
    pub fn insert(&self, tuple: Tuple) {
        let key = self.ordered(&tuple);
        self.write(key, MemoryEntry::Live(tuple));
    }

    /// Records a tombstone for `key`, hiding any live tuple with that key.
    pub fn delete(&self, key: &Tuple) {
        let key = self.ordered(key);
        let tombstone = key.tuple.clone();
        self.write(key, MemoryEntry::Tombstone(tombstone));
    }

    /// Newest entry stored under `key`.
    pub fn lookup(&self, key: &Tuple) -> Option<MemoryEntry> {
        let key = self.ordered(key);
        let entry = self
            .entries
            .lower_bound(Bound::Included(&VersionedKey::newest(key.clone())))?;
        (entry.key().key == key).then(|| entry.value().clone())
    }

    /// Live tuple stored under `key`.
    pub fn get(&self, key: &Tuple) -> Option<Tuple> {
        match self.lookup(key)? {
            MemoryEntry::Live(tuple) => Some(tuple),
            MemoryEntry::Tombstone(_) => None,
        }
    }

    /// True if the newest entry for `key` is a tombstone.
    pub fn is_deleted(&self, key: &Tuple) -> bool {
        self.lookup(key).is_some_and(|entry| entry.is_tombstone())
    }

    /// Newest entry of every key, in key order.
    pub fn newest_entries(&self) -> impl Iterator<Item = MemoryEntry> + '_ {
        let mut previous: Option<OrderedKey> = None;
        self.entries.iter().filter_map(move |entry| {
            let key = &entry.key().key;
            if previous.as_ref() == Some(key) {
                return None;
            }
            previous = Some(key.clone());
            Some(entry.value().clone())
        })
    }

    /// Number of live keys. Walks the list.
    pub fn primary_len(&self) -> usize {
        self.newest_entries().filter(|e| !e.is_tombstone()).count()
    }

    /// Number of tombstoned keys. Walks the list.
    pub fn buddy_len(&self) -> usize {
        self.newest_entries().filter(MemoryEntry::is_tombstone).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes written so far. Overwrites are counted again.
    pub fn approximate_bytes(&self) -> usize {
        self.approximate_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// True once the component has been replaced by a fresh one for writers.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Live tuples in key order.
    pub fn tuples(&self) -> impl Iterator<Item = Tuple> + '_ {
        self.newest_entries().filter_map(|entry| match entry {
            MemoryEntry::Live(tuple) => Some(tuple),
            MemoryEntry::Tombstone(_) => None,
        })
    }

    /// Tombstone keys in key order.
    pub fn tombstones(&self) -> impl Iterator<Item = Tuple> + '_ {
        self.newest_entries().filter_map(|entry| match entry {
            MemoryEntry::Tombstone(key) => Some(key),
            MemoryEntry::Live(_) => None,
        })
    }
}

/// Range cursor over a Memory component, yielding the newest entry of each
/// key, tombstones included.
///
/// Keeps no borrow of the skip list: each step seeks past every version of
/// the last returned key, so concurrent writes are tolerated.
pub(crate) struct MemoryRangeCursor {
    entries: Arc<MemoryMap>,
    comparator: Arc<MultiComparator>,
    predicate: RangePredicate,
    last: Option<OrderedKey>,
    exhausted: bool,
}

impl MemoryRangeCursor {
    pub(crate) fn new(memory: &MemoryComponent, predicate: &RangePredicate) -> Self {
        Self {
            entries: Arc::clone(&memory.entries),
            comparator: Arc::clone(&memory.comparator),
            predicate: predicate.clone(),
            last: None,
            exhausted: false,
        }
    }

    /// Retargets the cursor at another memory component.
    pub(crate) fn reset(&mut self, memory: &MemoryComponent, predicate: &RangePredicate) {
        self.entries = Arc::clone(&memory.entries);
        self.comparator = Arc::clone(&memory.comparator);
        self.predicate = predicate.clone();
        self.last = None;
        self.exhausted = false;
    }

    pub(crate) fn next_entry(&mut self) -> Option<MemoryEntry> {
        while !self.exhausted {
            let entry = match (&self.last, &self.predicate.low) {
                (Some(last), _) => self
                    .entries
                    .lower_bound(Bound::Excluded(&VersionedKey::oldest(last.clone()))),
                (None, Some(low)) => self.entries.lower_bound(Bound::Included(
                    &VersionedKey::newest(OrderedKey::new(low.clone(), &self.comparator)),
                )),
                (None, None) => self.entries.front(),
            };
            let Some(entry) = entry else {
                self.exhausted = true;
                break;
            };
            self.last = Some(entry.key().key.clone());
            let tuple = entry.value().tuple();
            if self.predicate.is_below_low(tuple) {
                continue;
            }
            if self.predicate.is_above_high(tuple) {
                self.exhausted = true;
                break;
            }
            return Some(entry.value().clone());
        }
        None
    }

    pub(crate) fn close(&mut self) {
        self.exhausted = true;
        self.last = None;
    }
}

// =============================================================================
// Disk component
// =============================================================================

/// Immutable component: a primary B+tree and a buddy B+tree of tombstones.
/// The buddy carries the bloom filter.
pub struct DiskComponent {
    primary: DiskBTree,
    buddy: DiskBTree,
}

impl DiskComponent {
    pub fn new(primary: DiskBTree, buddy: DiskBTree) -> Self {
        Self { primary, buddy }
    }

    pub fn primary(&self) -> &DiskBTree {
        &self.primary
    }

    pub fn buddy(&self) -> &DiskBTree {
        &self.buddy
    }

    pub fn primary_file(&self) -> u32 {
        self.primary.file_id()
    }

    pub fn buddy_file(&self) -> u32 {
        self.buddy.file_id()
    }

    pub fn tuple_count(&self) -> u64 {
        self.primary.tuple_count()
    }

    pub fn tombstone_count(&self) -> u64 {
        self.buddy.tuple_count()
    }

    pub fn size_bytes(&self) -> u64 {
        self.primary.size_bytes() + self.buddy.size_bytes()
    }
}

impl fmt::Debug for DiskComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskComponent")
            .field("primary_file", &self.primary_file())
            .field("buddy_file", &self.buddy_file())
            .field("tuples", &self.tuple_count())
            .field("tombstones", &self.tombstone_count())
            .finish()
    }
}

// =============================================================================
// Component
// =============================================================================

/// Physical representation of a component.
pub enum ComponentData {
    Memory(MemoryComponent),
    Disk(Arc<DiskComponent>),
}

/// One entry of the operational component list.
pub struct LsmComponent {
    id: ComponentId,
    created_at: u64,
    data: ComponentData,
    readers: AtomicUsize,
}

impl LsmComponent {
    pub fn memory(id: ComponentId, comparator: Arc<MultiComparator>) -> Self {
        Self {
            id,
            created_at: now_millis(),
            data: ComponentData::Memory(MemoryComponent::new(comparator)),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn disk(id: ComponentId, disk: DiskComponent, created_at: u64) -> Self {
        Self {
            id,
            created_at,
            data: ComponentData::Disk(Arc::new(disk)),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn data(&self) -> &ComponentData {
        &self.data
    }

    pub fn kind(&self) -> ComponentKind {
        match self.data {
            ComponentData::Memory(_) => ComponentKind::Memory,
            ComponentData::Disk(_) => ComponentKind::Disk,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryComponent> {
        match &self.data {
            ComponentData::Memory(memory) => Some(memory),
            ComponentData::Disk(_) => None,
        }
    }

    pub fn as_disk(&self) -> Option<&Arc<DiskComponent>> {
        match &self.data {
            ComponentData::Disk(disk) => Some(disk),
            ComponentData::Memory(_) => None,
        }
    }

    pub fn metadata(&self) -> ComponentMetadata {
        let (size_bytes, tuple_count, tombstone_count) = match &self.data {
            ComponentData::Memory(m) => (
                m.approximate_bytes() as u64,
                m.primary_len() as u64,
                m.buddy_len() as u64,
            ),
            ComponentData::Disk(d) => (d.size_bytes(), d.tuple_count(), d.tombstone_count()),
        };
        ComponentMetadata {
            id: self.id,
            kind: self.kind(),
            size_bytes,
            tuple_count,
            tombstone_count,
            created_at: self.created_at,
        }
    }

    /// Searches currently holding this component.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_reader(&self) {
        let previous = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reader count of {} went negative", self.id);
    }
}

impl fmt::Debug for LsmComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LsmComponent")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("readers", &self.readers())
            .finish()
    }
}
