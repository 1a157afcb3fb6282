//! Merge-with-buddy search cursor.
//!
//! One primary sub-cursor per component feeds a binary heap ordered by key,
//! then by component recency. For each key only the newest version is
//! considered. Memory tombstones travel in the primary stream and win the key
//! like any newer version. A surviving tuple is dropped if the buddy of the
//! same or any newer disk component holds a tombstone for it. Disk buddies are
//! probed through their bloom filter first; only a positive answer costs a
//! B+tree lookup.

use crate::component::{ComponentData, DiskComponent, LsmComponent, MemoryRangeCursor};
use crate::harness::{CursorInitialState, SearchLease};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use strata_common::{MultiComparator, RangePredicate, Result, StrataError, Tuple};
use strata_storage::DiskRangeCursor;
use tracing::{debug, warn};

/// Counters of one cursor, accumulated over every search it ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    /// Buddy probes answered by a bloom filter without touching the tree.
    pub bloom_negatives: u64,
    /// Buddy probes that searched a buddy B+tree.
    pub buddy_probes: u64,
    /// Opens that reused the previous sub-cursors.
    pub reused_opens: u64,
}

// =============================================================================
// Sub-cursors
// =============================================================================

pub(crate) enum PrimaryCursor {
    Memory(MemoryRangeCursor),
    Disk(DiskRangeCursor),
}

impl PrimaryCursor {
    fn open(component: &LsmComponent, predicate: &RangePredicate) -> Result<Self> {
        match component.data() {
            ComponentData::Memory(memory) => {
                Ok(PrimaryCursor::Memory(MemoryRangeCursor::new(memory, predicate)))
            }
            ComponentData::Disk(disk) => {
                Ok(PrimaryCursor::Disk(disk.primary().range_cursor(predicate)?))
            }
        }
    }

    fn matches(&self, component: &LsmComponent) -> bool {
        matches!(
            (self, component.data()),
            (PrimaryCursor::Memory(_), ComponentData::Memory(_))
                | (PrimaryCursor::Disk(_), ComponentData::Disk(_))
        )
    }

    fn reset(&mut self, component: &LsmComponent, predicate: &RangePredicate) -> Result<()> {
        match (self, component.data()) {
            (PrimaryCursor::Memory(cursor), ComponentData::Memory(memory)) => {
                cursor.reset(memory, predicate);
                Ok(())
            }
            (PrimaryCursor::Disk(cursor), ComponentData::Disk(disk)) => {
                disk.primary().reposition(cursor, predicate)
            }
            _ => Err(StrataError::Internal(format!(
                "sub-cursor does not match the variant of {}",
                component.id()
            ))),
        }
    }

    /// Next tuple and whether it is a tombstone.
    fn next_entry(&mut self) -> Result<Option<(Tuple, bool)>> {
        match self {
            PrimaryCursor::Memory(cursor) => Ok(cursor.next_entry().map(|entry| {
                let tombstone = entry.is_tombstone();
                (entry.tuple().clone(), tombstone)
            })),
            PrimaryCursor::Disk(cursor) => Ok(cursor.next_tuple()?.map(|tuple| (tuple, false))),
        }
    }

    fn close(&mut self) {
        match self {
            PrimaryCursor::Memory(cursor) => cursor.close(),
            PrimaryCursor::Disk(cursor) => cursor.close(),
        }
    }
}

/// Tombstone lookup against one component's buddy index.
pub(crate) enum BuddyProbe {
    /// Memory tombstones arrive through the primary stream.
    Memory,
    Disk(Arc<DiskComponent>),
}

impl BuddyProbe {
    fn for_component(component: &LsmComponent) -> Self {
        match component.data() {
            ComponentData::Memory(_) => BuddyProbe::Memory,
            ComponentData::Disk(disk) => BuddyProbe::Disk(Arc::clone(disk)),
        }
    }

    /// True if a bloom filter screens probes before the buddy tree is searched.
    pub(crate) fn is_bloom_filter_aware(&self) -> bool {
        matches!(self, BuddyProbe::Disk(_))
    }

    fn contains(&self, key: &Tuple, stats: &mut CursorStats) -> Result<bool> {
        match self {
            BuddyProbe::Memory => Ok(false),
            BuddyProbe::Disk(disk) => {
                if disk.tombstone_count() == 0 {
                    return Ok(false);
                }
                if !disk.buddy().may_contain(key) {
                    stats.bloom_negatives += 1;
                    return Ok(false);
                }
                stats.buddy_probes += 1;
                Ok(disk.buddy().point_lookup(key)?.is_some())
            }
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

struct HeapEntry {
    tuple: Tuple,
    tombstone: bool,
    source: usize,
    comparator: Arc<MultiComparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry: smallest key first, then the
        // newest component (lowest source index).
        self.comparator
            .compare(&other.tuple, &self.tuple)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge over per-component sub-cursors, newest component first.
pub(crate) struct MergeCore {
    comparator: Arc<MultiComparator>,
    primaries: Vec<PrimaryCursor>,
    buddies: Vec<BuddyProbe>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeCore {
    /// Merges the primaries of `components`, honoring their buddies.
    pub(crate) fn over_components(
        components: &[Arc<LsmComponent>],
        comparator: Arc<MultiComparator>,
        predicate: &RangePredicate,
    ) -> Result<Self> {
        let mut primaries = Vec::with_capacity(components.len());
        let mut buddies = Vec::with_capacity(components.len());
        for component in components {
            primaries.push(PrimaryCursor::open(component, predicate)?);
            buddies.push(BuddyProbe::for_component(component));
        }
        let mut core = Self {
            comparator,
            primaries,
            buddies,
            heap: BinaryHeap::with_capacity(components.len()),
        };
        core.prime()?;
        Ok(core)
    }

    /// Deduplicated union of the tombstone keys of `disks`.
    pub(crate) fn over_buddies(
        disks: &[Arc<DiskComponent>],
        comparator: Arc<MultiComparator>,
        predicate: &RangePredicate,
    ) -> Result<Self> {
        let primaries = disks
            .iter()
            .map(|disk| Ok(PrimaryCursor::Disk(disk.buddy().range_cursor(predicate)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut core = Self {
            comparator,
            heap: BinaryHeap::with_capacity(primaries.len()),
            primaries,
            buddies: Vec::new(),
        };
        core.prime()?;
        Ok(core)
    }

    fn can_reuse(&self, components: &[Arc<LsmComponent>], comparator: &MultiComparator) -> bool {
        self.comparator.is_compatible(comparator)
            && self.primaries.len() == components.len()
            && self
                .primaries
                .iter()
                .zip(components)
                .all(|(cursor, component)| cursor.matches(component))
    }

    fn reset(&mut self, components: &[Arc<LsmComponent>], predicate: &RangePredicate) -> Result<()> {
        for (cursor, component) in self.primaries.iter_mut().zip(components) {
            cursor.reset(component, predicate)?;
        }
        self.buddies.clear();
        self.buddies
            .extend(components.iter().map(|c| BuddyProbe::for_component(c)));
        self.prime()
    }

    fn prime(&mut self) -> Result<()> {
        self.heap.clear();
        for source in 0..self.primaries.len() {
            self.advance(source)?;
        }
        Ok(())
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some((tuple, tombstone)) = self.primaries[source].next_entry()? {
            self.heap.push(HeapEntry {
                tuple,
                tombstone,
                source,
                comparator: Arc::clone(&self.comparator),
            });
        }
        Ok(())
    }

    fn is_deleted(&self, tuple: &Tuple, source: usize, stats: &mut CursorStats) -> Result<bool> {
        let key = tuple.key(self.comparator.key_field_count());
        let newest = (source + 1).min(self.buddies.len());
        for probe in &self.buddies[..newest] {
            if probe.contains(&key, stats)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Next tuple that is the newest version of its key and not tombstoned.
    pub(crate) fn next_visible(&mut self, stats: &mut CursorStats) -> Result<Option<Tuple>> {
        while let Some(top) = self.heap.pop() {
            self.advance(top.source)?;
            // Older versions of the same key
            while self
                .heap
                .peek()
                .is_some_and(|next| self.comparator.compare(&next.tuple, &top.tuple) == Ordering::Equal)
            {
                if let Some(older) = self.heap.pop() {
                    self.advance(older.source)?;
                }
            }
            if top.tombstone || self.is_deleted(&top.tuple, top.source, stats)? {
                continue;
            }
            return Ok(Some(top.tuple));
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.heap.clear();
        for cursor in &mut self.primaries {
            cursor.close();
        }
        self.buddies.clear();
    }
}

// =============================================================================
// Search cursor
// =============================================================================

/// Deduplicated, deletion-aware range search over a component snapshot.
///
/// A cursor object can run many searches: `open`, iterate, `close`, then
/// `open` again. When the next snapshot has the same shape the sub-cursors
/// are repositioned instead of rebuilt.
#[derive(Default)]
pub struct LsmSearchCursor {
    core: Option<MergeCore>,
    buddy_comparator: Option<MultiComparator>,
    lease: Option<SearchLease>,
    ready: Option<Tuple>,
    current: Option<Tuple>,
    stats: CursorStats,
}

impl LsmSearchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a search over the snapshot in `state`.
    ///
    /// The cursor takes ownership of the snapshot's lease and gives it back
    /// on [`LsmSearchCursor::close`], including when opening fails.
    pub fn open(&mut self, state: CursorInitialState, predicate: &RangePredicate) -> Result<()> {
        if self.is_open() {
            self.close()?;
        }
        let CursorInitialState {
            components,
            primary_comparator,
            buddy_comparator,
            lease,
        } = state;
        self.lease = Some(lease);
        self.ready = None;
        self.current = None;

        if let Err(e) = self.attach(&components, primary_comparator, buddy_comparator, predicate) {
            if let Err(close_err) = self.close() {
                warn!(error = %close_err, "failed to release snapshot after a failed open");
            }
            return Err(e);
        }
        Ok(())
    }

    fn attach(
        &mut self,
        components: &[Arc<LsmComponent>],
        primary_comparator: MultiComparator,
        buddy_comparator: MultiComparator,
        predicate: &RangePredicate,
    ) -> Result<()> {
        if !predicate.comparator.is_compatible(&primary_comparator) {
            return Err(StrataError::ComparatorMismatch(
                "predicate comparator does not match the index".to_string(),
            ));
        }
        if !buddy_comparator.is_compatible(&primary_comparator) {
            return Err(StrataError::ComparatorMismatch(
                "buddy comparator does not match the primary key".to_string(),
            ));
        }
        predicate.validate()?;

        let reusable = match (&self.core, &self.buddy_comparator) {
            (Some(core), Some(previous)) => {
                core.can_reuse(components, &primary_comparator)
                    && previous.is_compatible(&buddy_comparator)
            }
            _ => false,
        };
        match self.core.as_mut() {
            Some(core) if reusable => {
                core.reset(components, predicate)?;
                self.stats.reused_opens += 1;
                debug!(components = components.len(), "reused search sub-cursors");
            }
            _ => {
                self.core = Some(MergeCore::over_components(
                    components,
                    Arc::new(primary_comparator),
                    predicate,
                )?);
            }
        }
        self.buddy_comparator = Some(buddy_comparator);
        Ok(())
    }

    /// True between a successful `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    /// Returns true if another tuple is available. A closed cursor has none.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.ready.is_some() {
            return Ok(true);
        }
        if self.lease.is_none() {
            return Ok(false);
        }
        if let Some(core) = self.core.as_mut() {
            self.ready = core.next_visible(&mut self.stats)?;
        }
        Ok(self.ready.is_some())
    }

    /// Moves to the next tuple.
    pub fn next(&mut self) -> Result<()> {
        if !self.has_next()? {
            return Err(StrataError::Internal(
                "next() called on an exhausted cursor".to_string(),
            ));
        }
        self.current = self.ready.take();
        Ok(())
    }

    /// Tuple at the current position.
    pub fn tuple(&self) -> Option<&Tuple> {
        self.current.as_ref()
    }

    /// `has_next` followed by `next`, returning the tuple.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        if !self.has_next()? {
            return Ok(None);
        }
        self.next()?;
        Ok(self.current.clone())
    }

    /// Remaining tuples, in key order.
    pub fn collect_remaining(&mut self) -> Result<Vec<Tuple>> {
        let mut tuples = Vec::new();
        while let Some(tuple) = self.next_tuple()? {
            tuples.push(tuple);
        }
        Ok(tuples)
    }

    /// Search cursors are read-only; updates go through delete and insert.
    pub fn mark_current_tuple_as_updated(&mut self) -> Result<()> {
        Err(StrataError::Unsupported(
            "search cursors cannot update tuples in place".to_string(),
        ))
    }

    /// Closes every sub-cursor, then releases the snapshot.
    pub fn close(&mut self) -> Result<()> {
        if let Some(core) = self.core.as_mut() {
            core.close();
        }
        self.ready = None;
        self.current = None;
        match self.lease.take() {
            Some(lease) => lease.release(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Number of components in the current snapshot.
    pub fn component_count(&self) -> usize {
        self.lease.as_ref().map_or(0, |lease| lease.components().len())
    }

    /// For each component of the open search, whether its buddy probe is
    /// bloom-filter aware. Newest component first.
    pub fn bloom_filter_aware(&self) -> Vec<bool> {
        self.core.as_ref().map_or_else(Vec::new, |core| {
            core.buddies.iter().map(BuddyProbe::is_bloom_filter_aware).collect()
        })
    }
}

impl Drop for LsmSearchCursor {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close search cursor on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentId;

    fn memory_component(id: u64, inserts: &[i64], deletes: &[i64]) -> Arc<LsmComponent> {
        let component = LsmComponent::memory(ComponentId(id), Arc::new(MultiComparator::int64(1)));
        let memory = component.as_memory().unwrap();
        for &k in inserts {
            memory.insert(Tuple::from_ints(&[k, id as i64]));
        }
        for &k in deletes {
            memory.delete(&Tuple::from_ints(&[k]));
        }
        Arc::new(component)
    }

    fn merged(components: &[Arc<LsmComponent>]) -> Vec<(i64, i64)> {
        let cmp = MultiComparator::int64(1);
        let mut core = MergeCore::over_components(
            components,
            Arc::new(cmp.clone()),
            &RangePredicate::full_scan(cmp),
        )
        .unwrap();
        let mut stats = CursorStats::default();
        std::iter::from_fn(|| core.next_visible(&mut stats).unwrap())
            .map(|t| (t.field(0).unwrap().as_i64().unwrap(), t.field(1).unwrap().as_i64().unwrap()))
            .collect()
    }

    #[test]
    fn test_heap_orders_by_key_then_recency() {
        let cmp = Arc::new(MultiComparator::int64(1));
        let mut heap = BinaryHeap::new();
        for (k, source) in [(5, 2), (1, 1), (5, 0), (3, 2)] {
            heap.push(HeapEntry {
                tuple: Tuple::from_ints(&[k]),
                tombstone: false,
                source,
                comparator: Arc::clone(&cmp),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.tuple.field(0).unwrap().as_i64().unwrap(), e.source))
            .collect();
        assert_eq!(order, vec![(1, 1), (3, 2), (5, 0), (5, 2)]);
    }

    #[test]
    fn test_newest_version_wins() {
        let newest = memory_component(3, &[2, 4], &[]);
        let oldest = memory_component(1, &[1, 2, 3, 4], &[]);
        assert_eq!(
            merged(&[newest, oldest]),
            vec![(1, 1), (2, 3), (3, 1), (4, 3)]
        );
    }

    #[test]
    fn test_tombstone_hides_older_versions_only() {
        // Newest deletes 2; middle re-inserted 3 after the oldest deleted it
        let newest = memory_component(3, &[], &[2]);
        let middle = memory_component(2, &[3], &[]);
        let oldest = memory_component(1, &[1, 2], &[3]);
        assert_eq!(merged(&[newest, middle, oldest]), vec![(1, 1), (3, 2)]);
    }

    #[test]
    fn test_memory_tombstone_then_reinsert_in_same_component() {
        let newest = memory_component(2, &[], &[]);
        let memory = newest.as_memory().unwrap();
        memory.delete(&Tuple::from_ints(&[7]));
        memory.insert(Tuple::from_ints(&[7, 2]));
        memory.delete(&Tuple::from_ints(&[8]));
        let oldest = memory_component(1, &[7, 8, 9], &[]);
        assert_eq!(merged(&[newest, oldest]), vec![(7, 2), (9, 1)]);
    }

    #[test]
    fn test_empty_component_list() {
        assert!(merged(&[]).is_empty());
    }

    #[test]
    fn test_mark_updated_is_unsupported() {
        let mut cursor = LsmSearchCursor::new();
        assert!(!cursor.is_open());
        assert!(!cursor.has_next().unwrap());
        assert!(matches!(
            cursor.mark_current_tuple_as_updated(),
            Err(StrataError::Unsupported(_))
        ));
        cursor.close().unwrap();
    }
}
