//! LSM harness: the control plane of one index.
//!
//! The operational component list is an immutable snapshot,
//! `[mutable Memory, sealed Memory…, Disk newest … Disk oldest]`, replaced
//! wholesale under a short write lock. Searches pin a snapshot by bumping
//! each component's reader count; flush and merge build new components
//! off to the side, make them durable, persist the manifest and only then
//! publish a new list. Replaced Disk components are deleted once their
//! last reader leaves.

use crate::component::{
    now_millis, ComponentId, ComponentKind, ComponentMetadata, DiskComponent, LsmComponent,
    MemoryComponent,
};
use crate::cursor::{CursorStats, MergeCore};
use crate::manifest::{Manifest, ManifestEntry, MANIFEST_VERSION};
use crate::policy::{create_merge_policy, MergePolicy};
use crate::tracker::{OperationKind, OperationTracker};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strata_buffer::BufferCache;
use strata_common::{LsmConfig, MultiComparator, RangePredicate, Result, StrataError, Tuple};
use strata_storage::{BloomFilter, BulkLoader, DiskBTree, DiskManager};
use tracing::{debug, info, warn};

/// Operational components, newest first.
pub type ComponentList = Arc<Vec<Arc<LsmComponent>>>;

/// Everything a search cursor needs to start: the pinned snapshot, the
/// comparators and the lease that gives the snapshot back.
pub struct CursorInitialState {
    pub components: ComponentList,
    pub primary_comparator: MultiComparator,
    pub buddy_comparator: MultiComparator,
    pub lease: SearchLease,
}

/// Capability to end one search.
///
/// Releasing it (explicitly or by dropping) decrements the reader count of
/// every component in the snapshot and lets retired components be reclaimed.
pub struct SearchLease {
    harness: Arc<LsmHarness>,
    components: ComponentList,
    released: bool,
}

impl SearchLease {
    pub fn components(&self) -> &[Arc<LsmComponent>] {
        &self.components
    }

    /// Ends the search. Errors come from reclaiming retired components.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.harness.exit_search(&self.components)
    }
}

impl Drop for SearchLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.harness.exit_search(&self.components) {
                warn!(error = %e, "failed to reclaim components after a search");
            }
        }
    }
}

/// Exits a writer from its Memory component on every path.
struct WriterGuard<'a> {
    tracker: &'a OperationTracker,
    component: ComponentId,
    success: bool,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.tracker.exit_modify(self.component, self.success);
    }
}

/// Control plane of one LSM index.
pub struct LsmHarness {
    config: LsmConfig,
    comparator: Arc<MultiComparator>,
    disk: Arc<DiskManager>,
    cache: Arc<BufferCache>,
    components: RwLock<ComponentList>,
    /// Serializes flush and merge.
    lifecycle: Mutex<()>,
    retired: Mutex<Vec<Arc<LsmComponent>>>,
    tracker: OperationTracker,
    policy: Box<dyn MergePolicy>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LsmHarness {
    /// Builds a harness over already opened Disk components (newest first)
    /// with a fresh Memory component in front.
    pub fn new(
        config: LsmConfig,
        comparator: MultiComparator,
        disk: Arc<DiskManager>,
        cache: Arc<BufferCache>,
        disk_components: Vec<Arc<LsmComponent>>,
        next_id: u64,
    ) -> Self {
        let comparator = Arc::new(comparator);
        let policy = create_merge_policy(&config.merge_policy);
        let memory = LsmComponent::memory(ComponentId(next_id), Arc::clone(&comparator));

        let mut list = Vec::with_capacity(disk_components.len() + 1);
        list.push(Arc::new(memory));
        list.extend(disk_components);

        Self {
            config,
            comparator,
            disk,
            cache,
            components: RwLock::new(Arc::new(list)),
            lifecycle: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            tracker: OperationTracker::new(),
            policy,
            next_id: AtomicU64::new(next_id + 1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LsmConfig {
        &self.config
    }

    pub fn comparator(&self) -> &MultiComparator {
        &self.comparator
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Current list without pinning it. For inspection only.
    pub fn components(&self) -> ComponentList {
        Arc::clone(&self.components.read())
    }

    pub fn component_count(&self) -> usize {
        self.components.read().len()
    }

    /// Replaced components still waiting for their readers.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Metadata of the operational Disk components, newest first.
    pub fn disk_component_metadata(&self) -> Vec<ComponentMetadata> {
        self.components()
            .iter()
            .filter(|c| c.kind() == ComponentKind::Disk)
            .map(|c| c.metadata())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StrataError::IndexClosed);
        }
        Ok(())
    }

    fn allocate_id(&self) -> ComponentId {
        ComponentId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Pins the current snapshot for a search.
    pub fn enter_search(self: &Arc<Self>) -> Result<CursorInitialState> {
        self.ensure_open()?;
        let components = {
            let list = self.components.read();
            for component in list.iter() {
                component.acquire_reader();
            }
            Arc::clone(&list)
        };
        self.tracker.begin(OperationKind::Search);

        Ok(CursorInitialState {
            components: Arc::clone(&components),
            primary_comparator: (*self.comparator).clone(),
            buddy_comparator: (*self.comparator).clone(),
            lease: SearchLease {
                harness: Arc::clone(self),
                components,
                released: false,
            },
        })
    }

    /// Unpins a snapshot taken by [`LsmHarness::enter_search`].
    pub(crate) fn exit_search(&self, components: &[Arc<LsmComponent>]) -> Result<()> {
        for component in components {
            component.release_reader();
        }
        self.tracker.end(OperationKind::Search, true);
        self.reclaim_retired().map(|_| ())
    }

    // =========================================================================
    // Modify
    // =========================================================================

    fn check_tuple(&self, tuple: &Tuple, is_delete: bool) -> Result<()> {
        let key_fields = self.comparator.key_field_count();
        if is_delete {
            if tuple.arity() != key_fields && tuple.arity() != self.config.field_count {
                return Err(StrataError::InvalidTuple(format!(
                    "delete needs a {}-field key, got {} fields",
                    key_fields,
                    tuple.arity()
                )));
            }
        } else if tuple.arity() != self.config.field_count {
            return Err(StrataError::InvalidTuple(format!(
                "index stores {} fields, got {}",
                self.config.field_count,
                tuple.arity()
            )));
        }
        self.comparator.check(tuple)
    }

    /// Inserts `tuple`, or records a tombstone for its key when `is_delete`.
    ///
    /// Returns true when the Memory component has reached its budget and a
    /// flush is due.
    pub fn modify(&self, tuple: Tuple, is_delete: bool) -> Result<bool> {
        self.ensure_open()?;
        self.check_tuple(&tuple, is_delete)?;

        // Entering under the read lock keeps a flush from sealing the
        // component between lookup and entry.
        let component = {
            let list = self.components.read();
            let component = list
                .first()
                .ok_or_else(|| StrataError::Internal("component list is empty".to_string()))?;
            self.tracker.enter_modify(component.id());
            Arc::clone(component)
        };
        let mut guard = WriterGuard {
            tracker: &self.tracker,
            component: component.id(),
            success: false,
        };

        let memory = component.as_memory().ok_or_else(|| {
            StrataError::Internal(format!("newest component {} is not in memory", component.id()))
        })?;
        if is_delete {
            memory.delete(&tuple.key(self.comparator.key_field_count()));
        } else {
            memory.insert(tuple);
        }
        guard.success = true;
        Ok(memory.approximate_bytes() >= self.config.memory_component_budget)
    }

    /// Size of the mutable Memory component.
    pub fn memory_bytes(&self) -> usize {
        self.components
            .read()
            .first()
            .and_then(|c| c.as_memory())
            .map_or(0, MemoryComponent::approximate_bytes)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes the oldest sealed Memory component to disk, sealing the
    /// mutable one first if none is waiting.
    ///
    /// Returns the new Disk component, or None if there was nothing to flush.
    /// On failure the sealed component stays visible and the next call
    /// retries it.
    pub fn flush(&self) -> Result<Option<ComponentId>> {
        self.ensure_open()?;
        let _lifecycle = self.lifecycle.lock();

        let target = match self.oldest_sealed_memory() {
            Some(sealed) => sealed,
            None => match self.seal_memory() {
                Some(sealed) => sealed,
                None => return Ok(None),
            },
        };
        self.tracker.wait_for_writers(target.id());

        self.tracker.begin(OperationKind::Flush);
        let result = self.flush_component(&target);
        self.tracker.end(OperationKind::Flush, result.is_ok());
        let id = result?;

        self.reclaim_retired()?;
        Ok(Some(id))
    }

    fn oldest_sealed_memory(&self) -> Option<Arc<LsmComponent>> {
        self.components
            .read()
            .iter()
            .rev()
            .find(|c| c.as_memory().is_some_and(MemoryComponent::is_sealed))
            .cloned()
    }

    /// Puts a fresh Memory component in front of a non-empty mutable one.
    fn seal_memory(&self) -> Option<Arc<LsmComponent>> {
        let mut list = self.components.write();
        let current = Arc::clone(list.first()?);
        let memory = current.as_memory()?;
        if memory.is_empty() {
            return None;
        }
        memory.seal();

        let fresh = LsmComponent::memory(self.allocate_id(), Arc::clone(&self.comparator));
        let mut next = Vec::with_capacity(list.len() + 1);
        next.push(Arc::new(fresh));
        next.extend(list.iter().cloned());
        *list = Arc::new(next);

        debug!(component = %current.id(), "sealed memory component");
        Some(current)
    }

    fn flush_component(&self, target: &Arc<LsmComponent>) -> Result<ComponentId> {
        let memory = target.as_memory().ok_or_else(|| {
            StrataError::Internal(format!("{} is not a memory component", target.id()))
        })?;
        info!(
            component = %target.id(),
            tuples = memory.primary_len(),
            tombstones = memory.buddy_len(),
            "flush started"
        );

        let disk = self.build_with_new_files(|primary_file, buddy_file| {
            let mut loader = self.loader(primary_file, None);
            for tuple in memory.tuples() {
                loader.add(&tuple)?;
            }
            loader.finish()?;
            let primary = self.open_tree(primary_file)?;

            let mut loader = self.loader(buddy_file, Some(self.tombstone_bloom(memory.buddy_len())));
            for key in memory.tombstones() {
                loader.add(&key)?;
            }
            loader.finish()?;
            let buddy = self.open_tree(buddy_file)?;

            Ok(DiskComponent::new(primary, buddy))
        })?;

        let component = Arc::new(LsmComponent::disk(self.allocate_id(), disk, now_millis()));
        self.install(&[target.id()], Arc::clone(&component))?;
        info!(
            component = %component.id(),
            from = %target.id(),
            tuples = component.metadata().tuple_count,
            "flush finished"
        );
        Ok(component.id())
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Asks the merge policy for candidates and merges them.
    ///
    /// Returns the merged component, or None if the policy chose nothing.
    pub fn merge(&self) -> Result<Option<ComponentId>> {
        self.ensure_open()?;
        let _lifecycle = self.lifecycle.lock();

        let metadata = self.disk_component_metadata();
        let Some(ids) = self.policy.select_merge_candidates(&metadata) else {
            return Ok(None);
        };
        debug!(policy = self.policy.name(), candidates = ids.len(), "merge selected");
        self.merge_locked(&ids).map(Some)
    }

    /// Merges the given contiguous run of Disk components, newest first.
    pub fn merge_components(&self, ids: &[ComponentId]) -> Result<ComponentId> {
        self.ensure_open()?;
        let _lifecycle = self.lifecycle.lock();
        self.merge_locked(ids)
    }

    /// Position of the run `ids` in `list`.
    fn validate_merge_set(list: &[Arc<LsmComponent>], ids: &[ComponentId]) -> Result<usize> {
        let first = ids
            .first()
            .ok_or_else(|| StrataError::InvalidMergeSet("empty merge set".to_string()))?;
        let start = list.iter().position(|c| c.id() == *first).ok_or_else(|| {
            StrataError::InvalidMergeSet(format!("{} is not an operational component", first))
        })?;
        if start + ids.len() > list.len() {
            return Err(StrataError::InvalidMergeSet(format!(
                "{} components starting at {} run past the oldest component",
                ids.len(),
                first
            )));
        }
        for (component, id) in list[start..].iter().zip(ids) {
            if component.id() != *id {
                return Err(StrataError::InvalidMergeSet(format!(
                    "{} is not contiguous with {}",
                    id, first
                )));
            }
            if component.kind() != ComponentKind::Disk {
                return Err(StrataError::InvalidMergeSet(format!(
                    "{} is not a disk component",
                    id
                )));
            }
        }
        Ok(start)
    }

    fn merge_locked(&self, ids: &[ComponentId]) -> Result<ComponentId> {
        let list = self.components();
        let start = Self::validate_merge_set(&list, ids)?;
        let run = &list[start..start + ids.len()];
        let includes_oldest = start + ids.len() == list.len();

        self.tracker.begin(OperationKind::Merge);
        let result = self.merge_run(run, includes_oldest);
        self.tracker.end(OperationKind::Merge, result.is_ok());
        let id = result?;

        self.reclaim_retired()?;
        Ok(id)
    }

    fn merge_run(&self, run: &[Arc<LsmComponent>], includes_oldest: bool) -> Result<ComponentId> {
        let disks: Vec<Arc<DiskComponent>> =
            run.iter().filter_map(|c| c.as_disk().cloned()).collect();
        let ids: Vec<ComponentId> = run.iter().map(|c| c.id()).collect();
        info!(
            components = run.len(),
            tuples = disks.iter().map(|d| d.tuple_count()).sum::<u64>(),
            includes_oldest,
            "merge started"
        );

        let predicate = RangePredicate::full_scan((*self.comparator).clone());
        let disk = self.build_with_new_files(|primary_file, buddy_file| {
            let mut stats = CursorStats::default();
            let mut merged = MergeCore::over_components(run, Arc::clone(&self.comparator), &predicate)?;
            let mut loader = self.loader(primary_file, None);
            while let Some(tuple) = merged.next_visible(&mut stats)? {
                loader.add(&tuple)?;
            }
            loader.finish()?;
            let primary = self.open_tree(primary_file)?;

            // Tombstones still have to hide keys in components older than
            // the run, unless the run reaches the oldest component or the
            // key is live in the merged primary.
            let expected = if includes_oldest {
                0
            } else {
                disks.iter().map(|d| d.tombstone_count() as usize).sum()
            };
            let mut loader = self.loader(buddy_file, Some(self.tombstone_bloom(expected)));
            if !includes_oldest {
                let mut tombstones =
                    MergeCore::over_buddies(&disks, Arc::clone(&self.comparator), &predicate)?;
                while let Some(key) = tombstones.next_visible(&mut stats)? {
                    if primary.point_lookup(&key)?.is_none() {
                        loader.add(&key)?;
                    }
                }
            }
            loader.finish()?;
            let buddy = self.open_tree(buddy_file)?;

            Ok(DiskComponent::new(primary, buddy))
        })?;

        let component = Arc::new(LsmComponent::disk(self.allocate_id(), disk, now_millis()));
        self.install(&ids, Arc::clone(&component))?;
        let metadata = component.metadata();
        info!(
            component = %component.id(),
            tuples = metadata.tuple_count,
            tombstones = metadata.tombstone_count,
            "merge finished"
        );
        Ok(component.id())
    }

    // =========================================================================
    // Component files
    // =========================================================================

    fn loader(&self, file_id: u32, bloom: Option<BloomFilter>) -> BulkLoader {
        BulkLoader::new(
            Arc::clone(&self.cache),
            file_id,
            (*self.comparator).clone(),
            bloom,
        )
    }

    fn open_tree(&self, file_id: u32) -> Result<DiskBTree> {
        DiskBTree::open(Arc::clone(&self.cache), file_id, (*self.comparator).clone())
    }

    fn tombstone_bloom(&self, expected: usize) -> BloomFilter {
        BloomFilter::with_rate(expected.max(1), self.config.bloom_false_positive_rate)
    }

    /// Runs `build` over two new files, deleting both if it fails.
    fn build_with_new_files(
        &self,
        build: impl FnOnce(u32, u32) -> Result<DiskComponent>,
    ) -> Result<DiskComponent> {
        let primary_file = self.disk.create_file()?;
        let buddy_file = match self.disk.create_file() {
            Ok(file_id) => file_id,
            Err(e) => {
                self.discard_files(&[primary_file]);
                return Err(e);
            }
        };
        build(primary_file, buddy_file).inspect_err(|e| {
            warn!(primary_file, buddy_file, error = %e, "component build failed");
            self.discard_files(&[primary_file, buddy_file]);
        })
    }

    /// Best-effort removal of files that never became operational.
    fn discard_files(&self, files: &[u32]) {
        for &file_id in files {
            let removed = self
                .cache
                .invalidate_file(file_id)
                .and_then(|_| self.disk.delete_file(file_id));
            if let Err(e) = removed {
                warn!(file_id, error = %e, "failed to remove component file");
            }
        }
    }

    fn destroy(&self, disk: &DiskComponent) -> Result<()> {
        for file_id in [disk.primary_file(), disk.buddy_file()] {
            self.cache.invalidate_file(file_id)?;
            self.disk.delete_file(file_id)?;
        }
        Ok(())
    }

    fn manifest_for(&self, list: &[Arc<LsmComponent>]) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            key_field_count: self.comparator.key_field_count(),
            next_component_id: self.next_id.load(Ordering::SeqCst),
            components: list
                .iter()
                .filter_map(|c| {
                    c.as_disk().map(|disk| ManifestEntry {
                        id: c.id().0,
                        primary_file: disk.primary_file(),
                        buddy_file: disk.buddy_file(),
                        tuple_count: disk.tuple_count(),
                        tombstone_count: disk.tombstone_count(),
                        created_at: c.created_at(),
                    })
                })
                .collect(),
        }
    }

    /// Writes the manifest for the current list.
    pub fn persist_manifest(&self) -> Result<()> {
        let list = self.components();
        self.manifest_for(&list)
            .store(self.disk.data_dir(), self.disk.fsync_enabled())
    }

    /// Replaces the contiguous run `replaced` with `component`.
    ///
    /// The manifest is written before the new list is published; if that
    /// fails the new component's files are removed and nothing changes.
    fn install(&self, replaced: &[ComponentId], component: Arc<LsmComponent>) -> Result<()> {
        let current = self.components();
        let start = Self::position_of_run(&current, replaced)?;
        let end = start + replaced.len();

        let mut next = Vec::with_capacity(current.len() + 1 - replaced.len());
        next.extend(current[..start].iter().cloned());
        next.push(Arc::clone(&component));
        next.extend(current[end..].iter().cloned());

        if let Err(e) = self
            .manifest_for(&next)
            .store(self.disk.data_dir(), self.disk.fsync_enabled())
        {
            if let Some(disk) = component.as_disk() {
                self.discard_files(&[disk.primary_file(), disk.buddy_file()]);
            }
            return Err(e);
        }

        *self.components.write() = Arc::new(next);

        let mut retired = self.retired.lock();
        for old in &current[start..end] {
            if old.kind() == ComponentKind::Disk {
                retired.push(Arc::clone(old));
            }
        }
        Ok(())
    }

    fn position_of_run(list: &[Arc<LsmComponent>], ids: &[ComponentId]) -> Result<usize> {
        let start = ids
            .first()
            .and_then(|first| list.iter().position(|c| c.id() == *first))
            .ok_or_else(|| StrataError::Internal("replaced component is gone".to_string()))?;
        let contiguous = list.len() >= start + ids.len()
            && list[start..].iter().zip(ids).all(|(c, id)| c.id() == *id);
        if !contiguous {
            return Err(StrataError::Internal(
                "replaced components are no longer contiguous".to_string(),
            ));
        }
        Ok(start)
    }

    /// Deletes retired Disk components that no search holds anymore.
    ///
    /// Returns how many were deleted. A component whose files could not be
    /// removed stays retired and is retried on the next call.
    pub fn reclaim_retired(&self) -> Result<usize> {
        let ready: Vec<Arc<LsmComponent>> = {
            let mut retired = self.retired.lock();
            let (ready, waiting) = retired.drain(..).partition(|c| c.readers() == 0);
            *retired = waiting;
            ready
        };

        let mut reclaimed = 0;
        let mut first_error = None;
        for component in ready {
            let Some(disk) = component.as_disk() else {
                continue;
            };
            match self.destroy(disk) {
                Ok(()) => {
                    debug!(component = %component.id(), "reclaimed retired component");
                    reclaimed += 1;
                }
                Err(e) => {
                    warn!(component = %component.id(), error = %e, "failed to reclaim component");
                    self.retired.lock().push(Arc::clone(&component));
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reclaimed),
        }
    }

    /// Refuses further operations and waits for a running flush or merge.
    ///
    /// Open searches keep working until they are closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _lifecycle = self.lifecycle.lock();
        self.reclaim_retired()?;
        Ok(())
    }
}

impl std::fmt::Debug for LsmHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmHarness")
            .field("components", &self.components())
            .field("retired", &self.retired_count())
            .field("policy", &self.policy.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
