//! Backing storage seam for the buffer cache.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{Result, StrataError};

/// File-addressed page storage behind the buffer cache.
pub trait PageStore: Send + Sync {
    /// Reads page `page_id` into `buf` (PAGE_SIZE bytes).
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` (PAGE_SIZE bytes) as page `page_id`.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()>;

    /// Makes every write to `file_id` durable.
    fn sync_file(&self, file_id: u32) -> Result<()>;
}

/// In-memory page store with write fault injection.
///
/// Used by tests and by callers that want a cache without files.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<PageId, Box<[u8]>>>,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryPageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of page reads served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of page writes accepted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns a copy of a stored page.
    pub fn page(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages.lock().get(&page_id).map(|p| p.to_vec())
    }

    /// Returns true if any page of `file_id` is stored.
    pub fn contains_file(&self, file_id: u32) -> bool {
        self.pages.lock().keys().any(|p| p.file_id == file_id)
    }
}

impl PageStore for MemoryPageStore {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.lock();
        let page = pages.get(&page_id).ok_or_else(|| {
            StrataError::IoError(format!("page {} does not exist", page_id))
        })?;
        buf[..PAGE_SIZE].copy_from_slice(page);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StrataError::IoError(format!(
                "injected write failure on page {}",
                page_id
            )));
        }
        self.pages
            .lock()
            .insert(page_id, buf[..PAGE_SIZE].to_vec().into_boxed_slice());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync_file(&self, _file_id: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_write_read() {
        let store = MemoryPageStore::new();
        let mut page = vec![0u8; PAGE_SIZE];
        page[7] = 0x42;
        store.write_page(PageId::new(1, 0), &page).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(PageId::new(1, 0), &mut buf).unwrap();
        assert_eq!(buf[7], 0x42);
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.write_count(), 1);
        assert!(store.contains_file(1));
        assert!(!store.contains_file(2));
    }

    #[test]
    fn test_memory_store_missing_page() {
        let store = MemoryPageStore::new();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(store.read_page(PageId::new(0, 3), &mut buf).is_err());
    }

    #[test]
    fn test_memory_store_fault_injection() {
        let store = MemoryPageStore::new();
        let page = vec![0u8; PAGE_SIZE];
        store.set_fail_writes(true);
        assert!(store.write_page(PageId::new(0, 0), &page).is_err());
        assert!(store.page(PageId::new(0, 0)).is_none());

        store.set_fail_writes(false);
        assert!(store.write_page(PageId::new(0, 0), &page).is_ok());
    }
}
