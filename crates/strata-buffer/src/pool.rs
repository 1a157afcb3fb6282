//! Buffer cache manager.

use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{ClockReplacer, Replacer};
use crate::store::PageStore;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{BufferCacheConfig, Result, StrataError};
use sysinfo::System;
use tracing::{debug, error, warn};

/// Page table and free frames. Every mapping change happens under this lock.
///
/// No store I/O and no page latch is taken while it is held. A frame that
/// needs I/O is pinned and marked in transit under the lock, and the I/O runs
/// after the lock is released.
struct Directory {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
}

/// A frame taken off the free list or away from an evicted page.
///
/// The frame is pinned and in transit until the reservation is completed or
/// abandoned.
struct Reservation {
    frame_id: FrameId,
    /// Dirty victim that stays mapped until its write-back succeeds.
    victim: Option<PageId>,
}

/// Buffer cache.
///
/// Manages a fixed-size pool of page frames backed by a [`PageStore`] with:
/// - Page ID to frame ID mapping
/// - Free frame list and clock replacement over unpinned frames
/// - Pin counting (RAII [`PageHandle`]) and per-page read/write latches
/// - Dirty page write-back on eviction, on flush, or from a background cleaner
/// - Frame confiscation for bulk loads that bypass the page table
pub struct BufferCache {
    config: BufferCacheConfig,
    store: Arc<dyn PageStore>,
    frames: Vec<BufferFrame>,
    directory: Mutex<Directory>,
    /// Signalled whenever a frame may have become available.
    frame_available: Condvar,
    /// Signalled whenever a frame leaves the in-transit state.
    io_complete: Condvar,
    /// Callers currently inside pin or confiscate.
    waiters: AtomicUsize,
    replacer: ClockReplacer,
    hits: AtomicU64,
    misses: AtomicU64,
    cleaner: Mutex<Option<CleanerHandle>>,
}

impl BufferCache {
    /// Creates a new buffer cache over `store`.
    ///
    /// Starts the background cleaner when the config sets an interval. The
    /// cleaner stops when the cache is dropped.
    pub fn new(config: BufferCacheConfig, store: Arc<dyn PageStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let num_frames = config.num_frames;
        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();
        // Reversed so that pop() hands out frame 0 first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();
        let cleaner_interval = config.cleaner_interval();

        let cache = Arc::new(Self {
            config,
            store,
            frames,
            directory: Mutex::new(Directory {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
            }),
            frame_available: Condvar::new(),
            io_complete: Condvar::new(),
            waiters: AtomicUsize::new(0),
            replacer: ClockReplacer::new(num_frames),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cleaner: Mutex::new(None),
        });

        if let Some(interval) = cleaner_interval {
            let handle = cache.start_cleaner(interval)?;
            *cache.cleaner.lock() = Some(handle);
            debug!(interval_ms = interval.as_millis() as u64, "started buffer cleaner");
        }
        Ok(cache)
    }

    /// Creates a buffer cache sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so that small machines still cache usefully.
    pub fn auto_sized(store: Arc<dyn PageStore>) -> Result<Arc<Self>> {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(
            BufferCacheConfig {
                num_frames,
                ..Default::default()
            },
            store,
        )
    }

    /// Returns the number of frames in the cache.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.directory.lock().free_list.len()
    }

    /// Returns the number of pages currently mapped.
    pub fn page_count(&self) -> usize {
        self.directory.lock().page_table.len()
    }

    /// Checks if a page is mapped in the cache.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.directory.lock().page_table.contains_key(&page_id)
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// True if the cache runs its own background cleaner.
    pub fn has_cleaner(&self) -> bool {
        self.cleaner.lock().is_some()
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &BufferFrame {
        &self.frames[frame_id.index()]
    }

    /// Pins a mapped frame. Caller holds the directory lock.
    fn pin_frame(&self, frame_id: FrameId) -> &BufferFrame {
        let frame = self.frame(frame_id);
        if frame.pin() == 0 {
            self.replacer.set_evictable(frame_id, false);
        }
        frame
    }

    /// Pins a page, reading it from the store on a miss.
    ///
    /// Blocks while every frame is pinned, up to the configured pin timeout,
    /// then fails with `BufferPoolFull`.
    pub fn pin(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        self.fetch(page_id, true)
    }

    /// Pins a page that is being created, mapping a zeroed frame without a read.
    ///
    /// Returns the existing frame if the page is already cached.
    pub fn pin_new(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        self.fetch(page_id, false)
    }

    fn fetch(&self, page_id: PageId, read_from_store: bool) -> Result<PageHandle<'_>> {
        let deadline = Instant::now() + self.config.pin_timeout();
        let reservation = {
            let mut dir = self.directory.lock();
            let _waiting = WaiterGuard::enter(&self.waiters);

            loop {
                if let Some(&frame_id) = dir.page_table.get(&page_id) {
                    if self.frame(frame_id).is_in_transit() {
                        self.wait_for_io(&mut dir, deadline)?;
                        continue;
                    }
                    let frame = self.pin_frame(frame_id);
                    self.replacer.record_access(frame_id);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageHandle::new(self, frame, page_id));
                }

                if let Some(reservation) = self.reserve_frame(&mut dir) {
                    // Later pins of the page wait for the load instead of loading it again
                    dir.page_table.insert(page_id, reservation.frame_id);
                    break reservation;
                }

                self.wait_for_frame(&mut dir, deadline)?;
            }
        };

        let frame = self.frame(reservation.frame_id);
        if let Err(e) = self.write_back_victim(&reservation) {
            self.abandon(reservation, Some(page_id), true);
            return Err(e);
        }
        if read_from_store {
            let result = {
                let mut data = frame.write_data();
                self.store.read_page(page_id, &mut data[..])
            };
            if let Err(e) = result {
                self.abandon(reservation, Some(page_id), false);
                return Err(e);
            }
        } else {
            frame.write_data().fill(0);
        }

        let mut dir = self.directory.lock();
        if let Some(victim) = reservation.victim {
            dir.page_table.remove(&victim);
        }
        frame.set_page_id(Some(page_id));
        frame.set_in_transit(false);
        self.replacer.record_access(reservation.frame_id);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.io_complete.notify_all();
        Ok(PageHandle::new(self, frame, page_id))
    }

    /// Takes a free frame, or evicts an unpinned one, and marks it in transit.
    ///
    /// A clean victim is unmapped at once. A dirty victim keeps its mapping
    /// until [`BufferCache::write_back_victim`] succeeds.
    fn reserve_frame(&self, dir: &mut Directory) -> Option<Reservation> {
        if let Some(frame_id) = dir.free_list.pop() {
            let frame = self.frame(frame_id);
            frame.pin();
            frame.set_in_transit(true);
            return Some(Reservation {
                frame_id,
                victim: None,
            });
        }

        while let Some(victim) = self.replacer.evict() {
            let frame = self.frame(victim);
            // The evictable set can lag behind a concurrent pin; re-check under the lock.
            if !frame.is_evictable() || frame.is_in_transit() {
                continue;
            }
            let Some(old_page_id) = frame.page_id() else {
                continue;
            };

            frame.pin();
            frame.set_in_transit(true);
            if frame.is_dirty() {
                return Some(Reservation {
                    frame_id: victim,
                    victim: Some(old_page_id),
                });
            }
            dir.page_table.remove(&old_page_id);
            frame.set_page_id(None);
            return Some(Reservation {
                frame_id: victim,
                victim: None,
            });
        }

        None
    }

    /// Writes a dirty victim back. Runs without the directory lock.
    fn write_back_victim(&self, reservation: &Reservation) -> Result<()> {
        let Some(old_page_id) = reservation.victim else {
            return Ok(());
        };
        let frame = self.frame(reservation.frame_id);
        let result = {
            let data = frame.read_data();
            self.store.write_page(old_page_id, &data[..])
        };
        match result {
            Ok(()) => {
                frame.set_dirty(false);
                debug!(page_id = %old_page_id, frame = %reservation.frame_id, "wrote back dirty victim");
                Ok(())
            }
            Err(e) => {
                warn!(page_id = %old_page_id, error = %e, "write-back of dirty victim failed");
                Err(e)
            }
        }
    }

    /// Gives up a reservation after failed I/O.
    ///
    /// If the victim write-back failed the victim stays mapped, dirty and
    /// evictable. Otherwise the frame goes back to the free list.
    fn abandon(&self, reservation: Reservation, new_page: Option<PageId>, victim_failed: bool) {
        let frame = self.frame(reservation.frame_id);
        let mut dir = self.directory.lock();
        if let Some(page_id) = new_page {
            dir.page_table.remove(&page_id);
        }
        match reservation.victim {
            Some(_) if victim_failed => {
                frame.unpin();
                frame.set_in_transit(false);
                self.replacer.set_evictable(reservation.frame_id, true);
            }
            victim => {
                if let Some(victim) = victim {
                    dir.page_table.remove(&victim);
                }
                frame.reset();
                dir.free_list.push(reservation.frame_id);
            }
        }
        self.io_complete.notify_all();
        self.frame_available.notify_all();
    }

    fn wait_for_frame(&self, dir: &mut MutexGuard<'_, Directory>, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline
            || self.frame_available.wait_until(dir, deadline).timed_out()
        {
            warn!(
                frames = self.frames.len(),
                timeout_ms = self.config.pin_timeout_ms,
                "no frame became available before the pin timeout"
            );
            return Err(StrataError::BufferPoolFull);
        }
        Ok(())
    }

    fn wait_for_io(&self, dir: &mut MutexGuard<'_, Directory>, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline
            || self.io_complete.wait_until(dir, deadline).timed_out()
        {
            warn!(
                timeout_ms = self.config.pin_timeout_ms,
                "page I/O did not finish before the pin timeout"
            );
            return Err(StrataError::BufferPoolFull);
        }
        Ok(())
    }

    fn notify_frame_available(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            // Taking the lock orders this wakeup after the waiter started waiting.
            let _dir = self.directory.lock();
            self.frame_available.notify_all();
        }
    }

    /// Drops one pin from `frame`.
    fn release_pin(&self, frame: &BufferFrame) -> Result<()> {
        match frame.unpin() {
            Some(0) => {
                if !frame.is_confiscated() {
                    self.replacer.set_evictable(frame.frame_id(), true);
                }
                self.notify_frame_available();
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                let page_id = frame.page_id().unwrap_or(PageId::new(u32::MAX, u32::MAX));
                if cfg!(debug_assertions) {
                    panic!("unpin of page {} at pin count zero", page_id);
                }
                error!(page_id = %page_id, frame = %frame.frame_id(), "unpin at pin count zero");
                Err(StrataError::PinViolation {
                    page_id,
                    reason: "unpin at pin count zero".to_string(),
                })
            }
        }
    }

    /// Releases a handle's pin explicitly.
    pub fn unpin(&self, handle: PageHandle<'_>) -> Result<()> {
        handle.unpin()
    }

    /// Releases one pin taken by a handle that was turned into a raw pin
    /// with [`PageHandle::into_pinned`].
    ///
    /// Unpinning a page that is not pinned is a pin discipline violation:
    /// it panics in debug builds and returns `PinViolation` in release builds.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_id = self
            .directory
            .lock()
            .page_table
            .get(&page_id)
            .copied()
            .ok_or_else(|| StrataError::PinViolation {
                page_id,
                reason: "unpin of a page that is not cached".to_string(),
            })?;
        let frame = self.frame(frame_id);
        if is_dirty {
            frame.set_dirty(true);
        }
        self.release_pin(frame)
    }

    /// Removes a free or evicted frame from the cache's accounting and hands
    /// it to the caller exclusively.
    ///
    /// The frame is neither mapped nor evictable until it is written with
    /// [`BufferCache::write_confiscated`] or released.
    pub fn confiscate(self: &Arc<Self>) -> Result<ConfiscatedPage> {
        let deadline = Instant::now() + self.config.pin_timeout();
        let reservation = {
            let mut dir = self.directory.lock();
            let _waiting = WaiterGuard::enter(&self.waiters);
            loop {
                if let Some(reservation) = self.reserve_frame(&mut dir) {
                    break reservation;
                }
                self.wait_for_frame(&mut dir, deadline)?;
            }
        };

        if let Err(e) = self.write_back_victim(&reservation) {
            self.abandon(reservation, None, true);
            return Err(e);
        }
        let frame = self.frame(reservation.frame_id);
        frame.write_data().fill(0);

        let mut dir = self.directory.lock();
        if let Some(victim) = reservation.victim {
            dir.page_table.remove(&victim);
        }
        frame.set_page_id(None);
        frame.set_confiscated(true);
        frame.unpin();
        frame.set_in_transit(false);
        self.io_complete.notify_all();
        Ok(ConfiscatedPage {
            cache: Arc::clone(self),
            frame_id: reservation.frame_id,
            returned: false,
        })
    }

    /// Writes a confiscated frame straight to the store as `page_id` and
    /// returns the frame to the free list, whether or not the write succeeds.
    pub fn write_confiscated(&self, mut page: ConfiscatedPage, page_id: PageId) -> Result<()> {
        let result = {
            let data = self.frame(page.frame_id).read_data();
            self.store.write_page(page_id, &data[..])
        };
        page.returned = true;
        self.return_frame(page.frame_id);
        result
    }

    /// Returns a confiscated frame without writing it.
    pub fn release_confiscated(&self, mut page: ConfiscatedPage) {
        page.returned = true;
        self.return_frame(page.frame_id);
    }

    fn return_frame(&self, frame_id: FrameId) {
        self.frame(frame_id).reset();
        let mut dir = self.directory.lock();
        dir.free_list.push(frame_id);
        self.frame_available.notify_all();
    }

    /// Pins the dirty mapped pages selected by `select` so they can be written
    /// without the directory lock.
    ///
    /// First waits out selected frames whose victim write-back is in flight, so
    /// a flush never returns ahead of an eviction of the same page.
    fn pin_dirty<F>(&self, select: F) -> Result<Vec<PageHandle<'_>>>
    where
        F: Fn(PageId, &BufferFrame) -> bool,
    {
        let deadline = Instant::now() + self.config.pin_timeout();
        let mut dir = self.directory.lock();
        loop {
            let writing = dir.page_table.iter().any(|(&page_id, &frame_id)| {
                let frame = self.frame(frame_id);
                frame.is_in_transit() && frame.is_dirty() && select(page_id, frame)
            });
            if !writing {
                break;
            }
            self.wait_for_io(&mut dir, deadline)?;
        }

        let mut handles = Vec::new();
        for (&page_id, &frame_id) in dir.page_table.iter() {
            let frame = self.frame(frame_id);
            if frame.is_in_transit() || !frame.is_dirty() || !select(page_id, frame) {
                continue;
            }
            handles.push(PageHandle::new(self, self.pin_frame(frame_id), page_id));
        }
        Ok(handles)
    }

    /// Writes a pinned page back if it is dirty. Holds the read latch across
    /// the write so the page cannot change underneath it.
    fn write_back(&self, handle: &PageHandle<'_>) -> Result<bool> {
        let data = handle.frame.read_data();
        if !handle.frame.is_dirty() {
            return Ok(false);
        }
        self.store.write_page(handle.page_id, &data[..])?;
        handle.frame.set_dirty(false);
        Ok(true)
    }

    /// Writes back pinned pages in order, stopping at the first failure.
    ///
    /// Returns the ids of the pages written.
    fn write_back_all(&self, handles: Vec<PageHandle<'_>>) -> Result<Vec<PageId>> {
        let mut written = Vec::with_capacity(handles.len());
        for handle in &handles {
            if self.write_back(handle)? {
                written.push(handle.page_id);
            }
        }
        Ok(written)
    }

    /// Writes a page back if it is dirty. Returns true if it was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let handles = self.pin_dirty(|candidate, _| candidate == page_id)?;
        Ok(!self.write_back_all(handles)?.is_empty())
    }

    /// Writes back every dirty page of `file_id` and syncs the file.
    ///
    /// Returns the number of pages written.
    pub fn flush_file(&self, file_id: u32) -> Result<usize> {
        let handles = self.pin_dirty(|page_id, _| page_id.file_id == file_id)?;
        let flushed = self.write_back_all(handles)?.len();
        self.store.sync_file(file_id)?;
        Ok(flushed)
    }

    /// Writes back every dirty page and syncs the touched files.
    ///
    /// Stops at the first failed write. Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let handles = self.pin_dirty(|_, _| true)?;
        let written = self.write_back_all(handles)?;
        let files: BTreeSet<u32> = written.iter().map(|page_id| page_id.file_id).collect();
        for file_id in files {
            self.store.sync_file(file_id)?;
        }
        Ok(written.len())
    }

    /// Writes back dirty pages that nobody has pinned. Used by the cleaner.
    fn clean_unpinned(&self) -> Result<usize> {
        let handles = self.pin_dirty(|_, frame| !frame.is_pinned())?;
        Ok(self.write_back_all(handles)?.len())
    }

    /// Drops every cached page of a deleted file without writing it back.
    ///
    /// Waits for in-flight I/O on the file's frames, then fails with
    /// `PinViolation`, dropping nothing, if any page of the file is still
    /// pinned. Returns the number of pages dropped.
    pub fn invalidate_file(&self, file_id: u32) -> Result<usize> {
        let deadline = Instant::now() + self.config.pin_timeout();
        let mut dir = self.directory.lock();
        let pages: Vec<(PageId, FrameId)> = loop {
            let pages: Vec<(PageId, FrameId)> = dir
                .page_table
                .iter()
                .filter(|(page_id, _)| page_id.file_id == file_id)
                .map(|(&page_id, &frame_id)| (page_id, frame_id))
                .collect();
            if pages.iter().any(|(_, fid)| self.frame(*fid).is_in_transit()) {
                self.wait_for_io(&mut dir, deadline)?;
                continue;
            }
            break pages;
        };

        if let Some((page_id, _)) = pages.iter().find(|(_, fid)| self.frame(*fid).is_pinned()) {
            return Err(StrataError::PinViolation {
                page_id: *page_id,
                reason: "invalidating a file with a pinned page".to_string(),
            });
        }

        for (page_id, frame_id) in &pages {
            dir.page_table.remove(page_id);
            self.replacer.remove(*frame_id);
            self.frame(*frame_id).reset();
            dir.free_list.push(*frame_id);
        }
        if !pages.is_empty() {
            debug!(file_id, pages = pages.len(), "invalidated cached pages");
            self.frame_available.notify_all();
        }
        Ok(pages.len())
    }

    /// Starts a background thread writing back dirty unpinned pages every
    /// `interval`. The thread stops when the returned handle is dropped or
    /// the cache goes away.
    pub fn start_cleaner(self: &Arc<Self>, interval: Duration) -> Result<CleanerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let cache: Weak<BufferCache> = Arc::downgrade(self);
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("strata-cleaner".to_string())
            .spawn(move || loop {
                std::thread::park_timeout(interval);
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match cache.clean_unpinned() {
                    Ok(0) => {}
                    Ok(cleaned) => debug!(cleaned, "cleaner wrote back dirty pages"),
                    Err(e) => warn!(error = %e, "cleaner write-back failed"),
                }
            })?;

        Ok(CleanerHandle {
            stop,
            thread: Some(thread),
        })
    }

    /// Returns statistics about the buffer cache.
    pub fn stats(&self) -> BufferCacheStats {
        let dir = self.directory.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for &frame_id in dir.page_table.values() {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }
        let confiscated_frames = self.frames.iter().filter(|f| f.is_confiscated()).count();

        BufferCacheStats {
            total_frames: self.frames.len(),
            free_frames: dir.free_list.len(),
            used_frames: dir.page_table.len(),
            pinned_frames,
            dirty_frames,
            confiscated_frames,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Statistics about the buffer cache.
#[derive(Debug, Clone)]
pub struct BufferCacheStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
    /// Number of frames held through confiscation.
    pub confiscated_frames: usize,
    /// Pins served from a mapped frame.
    pub hits: u64,
    /// Pins that had to map a frame.
    pub misses: u64,
}

impl BufferCacheStats {
    /// Fraction of pins served without mapping a frame.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// RAII pin on a cached page. Dropping the handle unpins the page.
///
/// Latches are taken through the handle and are orthogonal to the pin.
pub struct PageHandle<'a> {
    cache: &'a BufferCache,
    frame: &'a BufferFrame,
    page_id: PageId,
    released: bool,
}

impl<'a> PageHandle<'a> {
    fn new(cache: &'a BufferCache, frame: &'a BufferFrame, page_id: PageId) -> Self {
        Self {
            cache,
            frame,
            page_id,
            released: false,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the frame's current pin count.
    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }

    /// Returns true if the page has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Acquires the page latch in shared mode.
    pub fn read_latch(&self) -> PageReadLatch<'_> {
        PageReadLatch {
            guard: self.frame.read_data(),
        }
    }

    /// Acquires the page latch in exclusive mode.
    ///
    /// End it with [`PageWriteLatch::release`]; dropping it releases clean.
    pub fn write_latch(&self) -> PageWriteLatch<'_> {
        PageWriteLatch {
            guard: self.frame.write_data(),
            frame: self.frame,
        }
    }

    /// Keeps the pin past the handle. Release it with [`BufferCache::unpin_page`].
    pub fn into_pinned(mut self) -> PageId {
        self.released = true;
        self.page_id
    }

    /// Releases the pin explicitly.
    pub fn unpin(mut self) -> Result<()> {
        self.released = true;
        self.cache.release_pin(self.frame)
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cache.release_pin(self.frame) {
                error!(page_id = %self.page_id, error = %e, "failed to release pin");
            }
        }
    }
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame", &self.frame.frame_id())
            .finish()
    }
}

/// Shared page latch.
pub struct PageReadLatch<'a> {
    guard: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl Deref for PageReadLatch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

/// Exclusive page latch.
pub struct PageWriteLatch<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
    frame: &'a BufferFrame,
}

impl PageWriteLatch<'_> {
    /// Releases the latch, marking the page dirty if `mark_dirty`.
    pub fn release(self, mark_dirty: bool) {
        if mark_dirty {
            // Set while the latch is held so a concurrent write-back cannot clear it early.
            self.frame.set_dirty(true);
        }
    }
}

impl Deref for PageWriteLatch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

impl DerefMut for PageWriteLatch<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

/// A frame held exclusively outside of the cache's page table.
///
/// Dropping it without writing returns the frame to the free list.
pub struct ConfiscatedPage {
    cache: Arc<BufferCache>,
    frame_id: FrameId,
    returned: bool,
}

impl ConfiscatedPage {
    /// Returns the frame backing this page.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Reads the page contents.
    pub fn data(&self) -> PageReadLatch<'_> {
        PageReadLatch {
            guard: self.cache.frame(self.frame_id).read_data(),
        }
    }

    /// Mutable access to the page contents.
    pub fn data_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.cache.frame(self.frame_id).write_data()
    }
}

impl Drop for ConfiscatedPage {
    fn drop(&mut self) {
        if !self.returned {
            self.cache.return_frame(self.frame_id);
        }
    }
}

/// Handle of the background cleaner thread.
pub struct CleanerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    /// Stops the cleaner and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // The cleaner can hold the last reference to the cache it cleans
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("cleaner thread panicked");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
