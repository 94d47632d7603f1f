use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::common::{KeelError, PageId, Result, PAGE_SIZE};

/// DiskManager is responsible for reading and writing pages to/from disk.
///
/// Pages live in a single database file, indexed by page id in file-offset
/// order; ids are handed out densely starting from 0. A `.log` companion
/// file is opened alongside the database file for the write-ahead log layer
/// above this one.
pub struct DiskManager {
    /// Database file; None after shutdown
    db_file: Mutex<Option<File>>,
    /// Companion log file, contents owned by the logging layer
    log_file: Mutex<Option<File>>,
    db_path: PathBuf,
    /// Next page id to allocate
    next_page_id: AtomicU32,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (creating if necessary) the database file at `db_path` and its
    /// `.log` companion. Existing files resume page allocation after the
    /// last full page.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let mut log_path = db_path.clone().into_os_string();
        log_path.push(".log");
        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        let file_size = db_file.metadata()?.len();
        let existing_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            db_file: Mutex::new(Some(db_file)),
            log_file: Mutex::new(Some(log_file)),
            db_path,
            next_page_id: AtomicU32::new(existing_pages),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Allocates a new page id. Ids are dense: 0, 1, 2, ...
    pub fn allocate_page(&self) -> PageId {
        PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Releases a page id. The file is never shrunk; the id simply becomes
    /// dead space until a free-map is layered on top.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Reads a page from disk into the provided buffer.
    /// Reads past end-of-file zero-fill the buffer.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let offset = page_id.as_u64() * PAGE_SIZE as u64;

        let mut guard = self.db_file.lock();
        let file = guard.as_mut().ok_or_else(Self::shut_down_err)?;

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            data.fill(0);
        } else {
            file.seek(SeekFrom::Start(offset))?;
            let bytes_read = file.read(data)?;
            if bytes_read < PAGE_SIZE {
                data[bytes_read..].fill(0);
            }
        }

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer, extending the file
    /// as needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let offset = page_id.as_u64() * PAGE_SIZE as u64;

        let mut guard = self.db_file.lock();
        let file = guard.as_mut().ok_or_else(Self::shut_down_err)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes both files and closes them. Further I/O fails.
    pub fn shut_down(&self) -> Result<()> {
        debug!("disk manager shutting down: {:?}", self.db_path);
        if let Some(file) = self.db_file.lock().take() {
            file.sync_all()?;
        }
        if let Some(file) = self.log_file.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn shut_down_err() -> KeelError {
        KeelError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "disk manager has been shut down",
        ))
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Some(file) = self.db_file.get_mut().take() {
            let _ = file.sync_all();
        }
        if let Some(file) = self.log_file.get_mut().take() {
            let _ = file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_manager_new() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let dm = DiskManager::new(&db_path).unwrap();

        assert!(db_path.exists());
        assert!(temp_dir.path().join("test.db.log").exists());
        assert_eq!(dm.num_pages(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_dense_ids() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("alloc.db")).unwrap();

        for i in 0..5 {
            assert_eq!(dm.allocate_page(), PageId::new(i));
        }
    }

    #[test]
    fn test_disk_manager_read_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("rw.db")).unwrap();

        let page_id = dm.allocate_page();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        write_data[PAGE_SIZE - 1] = 128;
        dm.write_page(page_id, &write_data).unwrap();

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
        assert_eq!(read_data[PAGE_SIZE - 1], 128);
    }

    #[test]
    fn test_disk_manager_read_past_eof_zero_fills() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("eof.db")).unwrap();

        let mut data = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId::new(10), &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("persist.db");

        {
            let dm = DiskManager::new(&db_path).unwrap();
            let page_id = dm.allocate_page();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 123;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let dm = DiskManager::new(&db_path).unwrap();
            assert_eq!(dm.num_pages(), 1);

            let mut data = [0u8; PAGE_SIZE];
            dm.read_page(PageId::new(0), &mut data).unwrap();
            assert_eq!(data[0], 123);
        }
    }

    #[test]
    fn test_disk_manager_shut_down() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("down.db")).unwrap();

        let page_id = dm.allocate_page();
        dm.shut_down().unwrap();

        let data = [0u8; PAGE_SIZE];
        assert!(dm.write_page(page_id, &data).is_err());
    }
}
