//! Public face of one LSM index.

use crate::component::{ComponentId, ComponentKind, ComponentMetadata, DiskComponent, LsmComponent};
use crate::cursor::LsmSearchCursor;
use crate::harness::LsmHarness;
use crate::manifest::Manifest;
use crate::scheduler::{IoScheduler, IoTicket};
use crate::tracker::OperationStats;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_buffer::BufferCache;
use strata_common::{LsmConfig, MultiComparator, RangePredicate, Result, StrataError, Tuple};
use strata_storage::{DiskBTree, DiskManager};
use tracing::{info, warn};

/// Inspection counters of an index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub memory_components: usize,
    pub disk_components: usize,
    pub retired_components: usize,
    pub memory_bytes: usize,
    pub operations: OperationStats,
}

/// An LSM index over one data directory.
///
/// Writes land in the Memory component. A flush is scheduled on the IO
/// scheduler once the Memory component reaches its budget, and with
/// `auto_merge` every flush is followed by a merge policy check.
pub struct LsmIndex {
    harness: Arc<LsmHarness>,
    scheduler: IoScheduler,
    flush_pending: Arc<AtomicBool>,
}

impl LsmIndex {
    /// Creates an empty index in the disk manager's data directory.
    pub fn create(
        config: LsmConfig,
        comparator: MultiComparator,
        disk: Arc<DiskManager>,
        cache: Arc<BufferCache>,
    ) -> Result<Self> {
        Self::check_config(&config, &comparator)?;
        if Manifest::exists(disk.data_dir()) {
            return Err(StrataError::ConfigError(format!(
                "an index already exists in {}",
                disk.data_dir().display()
            )));
        }
        let index = Self::start(config, comparator, disk, cache, Vec::new(), 1)?;
        index.harness.persist_manifest()?;
        info!(dir = %index.harness.disk().data_dir().display(), "created index");
        Ok(index)
    }

    /// Reopens the index stored in the disk manager's data directory.
    ///
    /// Component files not listed in the manifest are leftovers of an
    /// interrupted flush or merge and are deleted.
    pub fn open(
        config: LsmConfig,
        comparator: MultiComparator,
        disk: Arc<DiskManager>,
        cache: Arc<BufferCache>,
    ) -> Result<Self> {
        Self::check_config(&config, &comparator)?;
        let manifest = Manifest::load(disk.data_dir())?.ok_or_else(|| {
            StrataError::ConfigError(format!("no index in {}", disk.data_dir().display()))
        })?;
        if manifest.key_field_count != comparator.key_field_count() {
            return Err(StrataError::ComparatorMismatch(format!(
                "index has {} key fields, comparator has {}",
                manifest.key_field_count,
                comparator.key_field_count()
            )));
        }

        let mut components = Vec::with_capacity(manifest.components.len());
        for entry in &manifest.components {
            let primary = DiskBTree::open(Arc::clone(&cache), entry.primary_file, comparator.clone())?;
            let buddy = DiskBTree::open(Arc::clone(&cache), entry.buddy_file, comparator.clone())?;
            components.push(Arc::new(LsmComponent::disk(
                ComponentId(entry.id),
                DiskComponent::new(primary, buddy),
                entry.created_at,
            )));
        }

        let referenced: HashSet<u32> = manifest.file_ids().collect();
        for file_id in disk.list_files()? {
            if !referenced.contains(&file_id) {
                warn!(file_id, "deleting orphaned component file");
                cache.invalidate_file(file_id)?;
                disk.delete_file(file_id)?;
            }
        }

        let index = Self::start(
            config,
            comparator,
            disk,
            cache,
            components,
            manifest.next_component_id,
        )?;
        info!(
            dir = %index.harness.disk().data_dir().display(),
            components = manifest.components.len(),
            "opened index"
        );
        Ok(index)
    }

    fn check_config(config: &LsmConfig, comparator: &MultiComparator) -> Result<()> {
        config.validate()?;
        if comparator.key_field_count() != config.key_field_count {
            return Err(StrataError::ConfigError(format!(
                "comparator orders {} key fields, configuration says {}",
                comparator.key_field_count(),
                config.key_field_count
            )));
        }
        Ok(())
    }

    fn start(
        config: LsmConfig,
        comparator: MultiComparator,
        disk: Arc<DiskManager>,
        cache: Arc<BufferCache>,
        components: Vec<Arc<LsmComponent>>,
        next_id: u64,
    ) -> Result<Self> {
        let scheduler = IoScheduler::new(config.io_threads)?;
        let harness = Arc::new(LsmHarness::new(
            config, comparator, disk, cache, components, next_id,
        ));
        Ok(Self {
            harness,
            scheduler,
            flush_pending: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn harness(&self) -> &Arc<LsmHarness> {
        &self.harness
    }

    // =========================================================================
    // Reads and writes
    // =========================================================================

    /// Inserts `tuple`, replacing any tuple with the same key.
    pub fn insert(&self, tuple: Tuple) -> Result<()> {
        let flush_due = self.harness.modify(tuple, false)?;
        self.after_modify(flush_due)
    }

    /// Deletes the tuple with key `key`. Deleting a missing key is not an error.
    pub fn delete(&self, key: &Tuple) -> Result<()> {
        let flush_due = self.harness.modify(key.clone(), true)?;
        self.after_modify(flush_due)
    }

    fn after_modify(&self, flush_due: bool) -> Result<()> {
        if flush_due && !self.flush_pending.swap(true, Ordering::AcqRel) {
            // The ticket is dropped; failures are logged by the scheduler.
            self.schedule_flush()?;
        }
        Ok(())
    }

    /// Opens a search over the current snapshot.
    pub fn search(&self, predicate: &RangePredicate) -> Result<LsmSearchCursor> {
        let mut cursor = LsmSearchCursor::new();
        self.search_with(&mut cursor, predicate)?;
        Ok(cursor)
    }

    /// Runs a new search on an existing cursor object, reusing its
    /// sub-cursors when the snapshot has the same shape.
    pub fn search_with(&self, cursor: &mut LsmSearchCursor, predicate: &RangePredicate) -> Result<()> {
        let state = self.harness.enter_search()?;
        cursor.open(state, predicate)
    }

    /// Looks up the tuple with key `key`.
    pub fn get(&self, key: &Tuple) -> Result<Option<Tuple>> {
        let key = key.key(self.harness.comparator().key_field_count());
        let predicate = RangePredicate::point(key, self.harness.comparator().clone());
        let mut cursor = self.search(&predicate)?;
        let found = cursor.next_tuple()?;
        cursor.close()?;
        Ok(found)
    }

    /// Every visible tuple in key order.
    pub fn scan_all(&self) -> Result<Vec<Tuple>> {
        let mut cursor = self.search(&RangePredicate::full_scan(self.harness.comparator().clone()))?;
        let tuples = cursor.collect_remaining()?;
        cursor.close()?;
        Ok(tuples)
    }

    // =========================================================================
    // Flush and merge
    // =========================================================================

    /// Flushes the Memory component now.
    ///
    /// With `auto_merge`, a merge policy check is scheduled afterwards.
    pub fn flush(&self) -> Result<Option<ComponentId>> {
        let flushed = self.harness.flush()?;
        if flushed.is_some() && self.harness.config().auto_merge {
            self.schedule_merge()?;
        }
        Ok(flushed)
    }

    /// Queues a flush on the IO scheduler.
    pub fn schedule_flush(&self) -> Result<IoTicket<Option<ComponentId>>> {
        let harness = Arc::clone(&self.harness);
        let pending = Arc::clone(&self.flush_pending);
        self.scheduler.submit("flush", move || {
            let flushed = harness.flush();
            pending.store(false, Ordering::Release);
            let flushed = flushed?;
            if flushed.is_some() && harness.config().auto_merge {
                harness.merge()?;
            }
            Ok(flushed)
        })
    }

    /// Merges now if the policy selects anything.
    pub fn merge(&self) -> Result<Option<ComponentId>> {
        self.harness.merge()
    }

    /// Queues a merge policy check on the IO scheduler.
    pub fn schedule_merge(&self) -> Result<IoTicket<Option<ComponentId>>> {
        let harness = Arc::clone(&self.harness);
        self.scheduler.submit("merge", move || harness.merge())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn component_count(&self) -> usize {
        self.harness.component_count()
    }

    pub fn disk_component_metadata(&self) -> Vec<ComponentMetadata> {
        self.harness.disk_component_metadata()
    }

    pub fn stats(&self) -> IndexStats {
        let components = self.harness.components();
        let memory_components = components
            .iter()
            .filter(|c| c.kind() == ComponentKind::Memory)
            .count();
        IndexStats {
            memory_components,
            disk_components: components.len() - memory_components,
            retired_components: self.harness.retired_count(),
            memory_bytes: self.harness.memory_bytes(),
            operations: self.harness.tracker().stats(),
        }
    }

    /// Waits for background jobs and closes the index.
    ///
    /// Contents of the Memory component that were never flushed are dropped.
    pub fn close(&self) -> Result<()> {
        self.scheduler.shutdown();
        self.harness.close()
    }
}

impl Drop for LsmIndex {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close index");
        }
    }
}
