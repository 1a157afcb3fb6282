//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_buffer::PageStore;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{Result, StorageConfig, StrataError};
use tracing::{debug, warn};

const FILE_EXTENSION: &str = "dat";

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for component files.
    pub data_dir: PathBuf,
    /// Make `sync_file` call fsync.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

impl From<&StorageConfig> for DiskManagerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Reads and writes pages of numbered files in one directory.
///
/// File ids are handed out by [`DiskManager::create_file`] and never reused
/// while the manager lives; on startup numbering resumes after the highest
/// file found on disk.
pub struct DiskManager {
    config: DiskManagerConfig,
    files: Mutex<HashMap<u32, FileHandle>>,
    next_file_id: AtomicU32,
}

struct FileHandle {
    file: File,
    num_pages: u32,
}

impl DiskManager {
    /// Creates a disk manager over `config.data_dir`, creating the directory.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let dm = Self {
            config,
            files: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
        };
        let highest = dm.list_files()?.into_iter().max().unwrap_or(0);
        dm.next_file_id.store(highest + 1, Ordering::SeqCst);
        Ok(dm)
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// True if `sync_file` reaches the disk.
    pub fn fsync_enabled(&self) -> bool {
        self.config.fsync_enabled
    }

    /// Generates the file path for a given file ID.
    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{:08}.{}", file_id, FILE_EXTENSION))
    }

    /// Creates a new empty file and returns its id.
    pub fn create_file(&self) -> Result<u32> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.file_path(file_id))?;

        self.files
            .lock()
            .insert(file_id, FileHandle { file, num_pages: 0 });
        debug!(file_id, "created file");
        Ok(file_id)
    }

    /// Returns true if the file exists on disk.
    pub fn file_exists(&self, file_id: u32) -> bool {
        self.file_path(file_id).exists()
    }

    /// Lists the ids of every file in the data directory, ascending.
    pub fn list_files(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Opens a data file into the handle table.
    fn open_file<'a>(
        &self,
        files: &'a mut HashMap<u32, FileHandle>,
        file_id: u32,
        create: bool,
    ) -> Result<&'a mut FileHandle> {
        if !files.contains_key(&file_id) {
            let path = self.file_path(file_id);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StrataError::IoError(format!(
                        "file {} does not exist",
                        file_id
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
            files.insert(file_id, FileHandle { file, num_pages });
        }
        files
            .get_mut(&file_id)
            .ok_or_else(|| StrataError::Internal(format!("file {} not open", file_id)))
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        let mut files = self.files.lock();
        Ok(self.open_file(&mut files, file_id, false)?.num_pages)
    }

    /// Syncs every open file.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes a specific file.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&file_id) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a data file. Deleting a missing file is not an error.
    pub fn delete_file(&self, file_id: u32) -> Result<()> {
        self.files.lock().remove(&file_id);
        match std::fs::remove_file(self.file_path(file_id)) {
            Ok(()) => {
                debug!(file_id, "deleted file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl PageStore for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let mut files = self.files.lock();
        let handle = self.open_file(&mut files, page_id.file_id, false)?;

        if page_id.page_num >= handle.num_pages {
            return Err(StrataError::IoError(format!(
                "page {} does not exist in file {}",
                page_id.page_num, page_id.file_id
            )));
        }

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.read_exact(&mut buf[..PAGE_SIZE])?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        let mut files = self.files.lock();
        let handle = self.open_file(&mut files, page_id.file_id, true)?;

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(&buf[..PAGE_SIZE])?;

        // Update page count if we extended the file
        if page_id.page_num >= handle.num_pages {
            handle.num_pages = page_id.page_num + 1;
        }
        Ok(())
    }

    fn sync_file(&self, file_id: u32) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        let mut files = self.files.lock();
        let handle = self.open_file(&mut files, file_id, false)?;
        handle.file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!(error = %e, "failed to sync files on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    fn page_with(byte: u8) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = byte;
        page[PAGE_SIZE - 1] = byte;
        page
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
        assert!(dm.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_create_file_ids_are_sequential() {
        let (dm, _dir) = create_test_disk_manager();
        let a = dm.create_file().unwrap();
        let b = dm.create_file().unwrap();
        assert_eq!(b, a + 1);
        assert!(dm.file_exists(a));
        assert_eq!(dm.num_pages(a).unwrap(), 0);
        assert_eq!(dm.list_files().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_write_read() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create_file().unwrap();

        // Pages may be written out of order; the file grows to the highest one
        dm.write_page(PageId::new(file_id, 2), &page_with(0xCD)).unwrap();
        dm.write_page(PageId::new(file_id, 0), &page_with(0xAB)).unwrap();
        assert_eq!(dm.num_pages(file_id).unwrap(), 3);

        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId::new(file_id, 2), &mut buf).unwrap();
        assert_eq!(buf[0], 0xCD);
        assert_eq!(buf[PAGE_SIZE - 1], 0xCD);
        dm.read_page(PageId::new(file_id, 0), &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn test_read_missing_page_and_file() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create_file().unwrap();
        dm.write_page(PageId::new(file_id, 0), &page_with(1)).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(dm.read_page(PageId::new(file_id, 99), &mut buf).is_err());
        assert!(dm.read_page(PageId::new(4242, 0), &mut buf).is_err());
        // Reading never creates the file
        assert!(!dm.file_exists(4242));
    }

    #[test]
    fn test_persistence_and_id_resume() {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: true,
        };
        let file_id;
        {
            let dm = DiskManager::new(config.clone()).unwrap();
            file_id = dm.create_file().unwrap();
            dm.write_page(PageId::new(file_id, 0), &page_with(0xFF)).unwrap();
            dm.sync_file(file_id).unwrap();
        }

        let dm = DiskManager::new(config).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId::new(file_id, 0), &mut buf).unwrap();
        assert_eq!(buf[0], 0xFF);
        assert!(dm.create_file().unwrap() > file_id);
    }

    #[test]
    fn test_delete_file() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create_file().unwrap();
        dm.write_page(PageId::new(file_id, 0), &page_with(1)).unwrap();
        let path = dm.file_path(file_id);
        assert!(path.exists());

        dm.delete_file(file_id).unwrap();
        assert!(!path.exists());
        // Idempotent
        dm.delete_file(file_id).unwrap();
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let (dm, dir) = create_test_disk_manager();
        std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.dat"), b"").unwrap();
        let file_id = dm.create_file().unwrap();
        assert_eq!(dm.list_files().unwrap(), vec![file_id]);
    }

    #[test]
    fn test_config_from_storage_config() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/tmp/strata-x"),
            fsync_enabled: false,
            ..Default::default()
        };
        let config = DiskManagerConfig::from(&storage);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/strata-x"));
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_close_and_reopen_file() {
        let (dm, _dir) = create_test_disk_manager();
        let file_id = dm.create_file().unwrap();
        dm.write_page(PageId::new(file_id, 0), &page_with(7)).unwrap();
        dm.close_file(file_id).unwrap();
        dm.flush().unwrap();
        assert_eq!(dm.num_pages(file_id).unwrap(), 1);
    }
}
