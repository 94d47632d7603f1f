use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::BpmState;
use super::FrameHeader;

/// RAII guard for read access to a page.
///
/// Holds one pin and the page latch in read mode; dropping releases the
/// latch and then unpins. The buffer pool hands these out via
/// `fetch_page_read`.
pub struct ReadPageGuard {
    page_id: PageId,
    /// Keeps the frame alive for the lifetime of the transmuted lock guard
    _frame: Arc<FrameHeader>,
    state: Arc<BpmState>,
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// # Safety
    /// The frame must be pinned by the caller; the pin is consumed by this
    /// guard and released on drop.
    pub(crate) unsafe fn new(page_id: PageId, frame: Arc<FrameHeader>, state: Arc<BpmState>) -> Self {
        let data_guard = frame.data.read();
        // Transmute to 'static: the Arc keeps the frame (and its lock) alive
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            state,
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Release the latch before giving the pin back
        self.data_guard.take();
        self.state.complete_unpin(self.page_id, false);
    }
}

/// RAII guard for write access to a page.
///
/// Holds one pin and the page latch in write mode. The first `data_mut`
/// call marks the page dirty; the drop impl releases the latch and unpins
/// with the accumulated dirty flag.
pub struct WritePageGuard {
    page_id: PageId,
    _frame: Arc<FrameHeader>,
    state: Arc<BpmState>,
    is_dirty: bool,
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// # Safety
    /// The frame must be pinned by the caller; the pin is consumed by this
    /// guard and released on drop.
    pub(crate) unsafe fn new(page_id: PageId, frame: Arc<FrameHeader>, state: Arc<BpmState>) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            state,
            is_dirty: false,
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.data_guard.as_mut().unwrap()[..]
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.data_guard.take();
        self.state.complete_unpin(self.page_id, self.is_dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::super::BufferPoolManager;
    use crate::storage::disk::DiskManager;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_guard_releases_pin_on_drop() {
        let temp_dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path().join("guard.db")).unwrap());
        let bpm = BufferPoolManager::new(4, dm);

        let page_id = {
            let guard = bpm.new_page_write().unwrap().unwrap();
            let page_id = guard.page_id();
            assert_eq!(bpm.get_pin_count(page_id), Some(1));
            page_id
        };
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_write_guard_marks_dirty() {
        let temp_dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path().join("dirty.db")).unwrap());
        let bpm = BufferPoolManager::new(4, dm);

        let page_id = {
            let mut guard = bpm.new_page_write().unwrap().unwrap();
            guard.data_mut()[0] = 1;
            guard.page_id()
        };

        let frame = bpm.fetch_page(page_id).unwrap().unwrap();
        assert!(frame.is_dirty());
        bpm.unpin_page(page_id, false);
    }

    #[test]
    fn test_read_guards_share_the_latch() {
        let temp_dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path().join("share.db")).unwrap());
        let bpm = BufferPoolManager::new(4, dm);

        let page_id = bpm.new_page().unwrap().unwrap().page_id();
        bpm.unpin_page(page_id, false);

        let g1 = bpm.fetch_page_read(page_id).unwrap().unwrap();
        let g2 = bpm.fetch_page_read(page_id).unwrap().unwrap();
        assert_eq!(g1.data()[0], g2.data()[0]);
        assert_eq!(bpm.get_pin_count(page_id), Some(2));
    }
}
