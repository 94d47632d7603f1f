use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruReplacer, ReadPageGuard, WritePageGuard};

struct Inner {
    /// Page table: maps page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames that have never held a page or were freed by delete_page
    free_list: VecDeque<FrameId>,
}

/// State shared between the manager and the page guards it hands out.
///
/// One mutex serialises every page-table, free-list and pin transition; the
/// contract permits holding it across the synchronous disk I/O of a victim
/// write-back or a page read.
pub(crate) struct BpmState {
    frames: Vec<Arc<FrameHeader>>,
    inner: Mutex<Inner>,
    replacer: LruReplacer,
    disk_scheduler: DiskScheduler,
}

impl BpmState {
    fn frame(&self, frame_id: FrameId) -> &Arc<FrameHeader> {
        &self.frames[frame_id.as_usize()]
    }

    /// Unpin path shared by `unpin_page` and the guards' drop impls.
    pub(crate) fn complete_unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };
        let frame = self.frame(frame_id);
        if is_dirty {
            frame.set_dirty(true);
        }
        match frame.unpin() {
            None => false,
            Some(0) => {
                self.replacer.unpin(frame_id);
                true
            }
            Some(_) => true,
        }
    }
}

/// BufferPoolManager caches a bounded set of disk pages in memory frames.
///
/// `fetch_page`/`new_page` return the frame pinned once; every pin must be
/// matched by an `unpin_page` (or returned through a page guard, which
/// unpins on drop). When all frames are pinned both calls report exhaustion
/// with `Ok(None)` rather than an error.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<BpmState>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            state: Arc::new(BpmState {
                frames,
                inner: Mutex::new(Inner {
                    page_table: HashMap::new(),
                    free_list,
                }),
                replacer: LruReplacer::new(pool_size),
                disk_scheduler: DiskScheduler::new(disk_manager),
            }),
        }
    }

    /// Fetches the page into the pool, pinning it. Returns Ok(None) when the
    /// page is not cached and every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Option<Arc<FrameHeader>>> {
        let state = &self.state;
        let mut inner = state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = state.frame(frame_id);
            frame.pin();
            state.replacer.pin(frame_id);
            return Ok(Some(Arc::clone(frame)));
        }

        let frame_id = match self.take_victim_frame(&mut inner)? {
            Some(frame_id) => frame_id,
            None => return Ok(None),
        };

        let frame = state.frame(frame_id);
        let mut buf = [0u8; PAGE_SIZE];
        state.disk_scheduler.schedule_read_sync(page_id, &mut buf)?;
        frame.set_page_id(page_id);
        frame.copy_from(&buf);
        frame.set_dirty(false);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);
        trace!("fetched {} into {}", page_id, frame_id);
        Ok(Some(Arc::clone(frame)))
    }

    /// Allocates a fresh page id and installs a zeroed page for it, pinned.
    /// Returns Ok(None) iff no frame is free and no frame is evictable; no
    /// page id is consumed in that case.
    pub fn new_page(&self) -> Result<Option<Arc<FrameHeader>>> {
        let state = &self.state;
        let mut inner = state.inner.lock();

        let frame_id = match self.take_victim_frame(&mut inner)? {
            Some(frame_id) => frame_id,
            None => return Ok(None),
        };

        let page_id = state.disk_scheduler.disk_manager().allocate_page();

        let frame = state.frame(frame_id);
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);
        trace!("new page {} in {}", page_id, frame_id);
        Ok(Some(Arc::clone(frame)))
    }

    /// Drops one pin on the page. Returns false if the page is not cached or
    /// its pin count is already zero. The dirty flag is ORed in.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.complete_unpin(page_id, is_dirty)
    }

    /// Writes the page image to disk (dirty or not) and clears the dirty
    /// flag. Returns false if the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = &self.state;
        let inner = state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = state.frame(frame_id);
            let mut buf = [0u8; PAGE_SIZE];
            frame.copy_to(&mut buf);
            state.disk_scheduler.schedule_write_sync(page_id, &buf)?;
            frame.set_dirty(false);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flushes every cached page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = &self.state;
        let inner = state.inner.lock();

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = state.frame(frame_id);
            let mut buf = [0u8; PAGE_SIZE];
            frame.copy_to(&mut buf);
            state.disk_scheduler.schedule_write_sync(page_id, &buf)?;
            frame.set_dirty(false);
        }
        Ok(())
    }

    /// Evicts the page and returns its frame to the free list. Returns false
    /// while the page is pinned; a page that is not cached deletes trivially.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let state = &self.state;
        let mut inner = state.inner.lock();

        let frame_id = match inner.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                state.disk_scheduler.disk_manager().deallocate_page(page_id);
                return Ok(true);
            }
        };

        let frame = state.frame(frame_id);
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        inner.page_table.remove(&page_id);
        state.replacer.pin(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        state.disk_scheduler.disk_manager().deallocate_page(page_id);
        Ok(true)
    }

    /// Fetches the page and latches it for reading. The guard unpins on drop.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<Option<ReadPageGuard>> {
        match self.fetch_page(page_id)? {
            Some(frame) => Ok(Some(unsafe {
                ReadPageGuard::new(page_id, frame, Arc::clone(&self.state))
            })),
            None => Ok(None),
        }
    }

    /// Fetches the page and latches it for writing. The guard marks the page
    /// dirty on mutation and unpins on drop.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<Option<WritePageGuard>> {
        match self.fetch_page(page_id)? {
            Some(frame) => Ok(Some(unsafe {
                WritePageGuard::new(page_id, frame, Arc::clone(&self.state))
            })),
            None => Ok(None),
        }
    }

    /// Allocates a new page and returns it write-latched.
    pub fn new_page_write(&self) -> Result<Option<WritePageGuard>> {
        match self.new_page()? {
            Some(frame) => {
                let page_id = frame.page_id();
                Ok(Some(unsafe {
                    WritePageGuard::new(page_id, frame, Arc::clone(&self.state))
                }))
            }
            None => Ok(None),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = &self.state;
        let inner = state.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.frame(frame_id).pin_count())
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.state.disk_scheduler.disk_manager()
    }

    /// Finds a frame for an incoming page: free list first, then the
    /// replacer. A dirty victim is written back synchronously before its
    /// mapping is removed.
    fn take_victim_frame(&self, inner: &mut Inner) -> Result<Option<FrameId>> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(Some(frame_id));
        }

        let frame_id = match self.state.replacer.victim() {
            Some(frame_id) => frame_id,
            None => return Ok(None),
        };

        let frame = self.state.frame(frame_id);
        let old_page_id = frame.page_id();
        if frame.is_dirty() {
            let mut buf = [0u8; PAGE_SIZE];
            frame.copy_to(&mut buf);
            self.state
                .disk_scheduler
                .schedule_write_sync(old_page_id, &buf)?;
        }
        inner.page_table.remove(&old_page_id);
        frame.reset();
        trace!("evicted {} from {}", old_page_id, frame_id);
        Ok(Some(frame_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path().join("bpm.db")).unwrap());
        (BufferPoolManager::new(pool_size, dm), temp_dir)
    }

    #[test]
    fn test_new_page_pins_frame() {
        let (bpm, _dir) = create_bpm(10);

        let frame = bpm.new_page().unwrap().unwrap();
        assert_eq!(frame.page_id(), PageId::new(0));
        assert_eq!(bpm.get_pin_count(frame.page_id()), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);
    }

    #[test]
    fn test_unpin_twice_fails() {
        let (bpm, _dir) = create_bpm(10);

        let page_id = bpm.new_page().unwrap().unwrap().page_id();
        assert!(bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(page_id, false));
    }

    #[test]
    fn test_write_survives_eviction() {
        let (bpm, _dir) = create_bpm(2);

        let page_id = {
            let mut guard = bpm.new_page_write().unwrap().unwrap();
            guard.data_mut()[0] = 0xAB;
            guard.page_id()
        };

        // churn both frames so the page is evicted
        for _ in 0..2 {
            let pid = bpm.new_page().unwrap().unwrap().page_id();
            bpm.unpin_page(pid, false);
        }

        let guard = bpm.fetch_page_read(page_id).unwrap().unwrap();
        assert_eq!(guard.data()[0], 0xAB);
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let (bpm, _dir) = create_bpm(2);

        let _g1 = bpm.new_page_write().unwrap().unwrap();
        let _g2 = bpm.new_page_write().unwrap().unwrap();

        assert!(bpm.new_page().unwrap().is_none());
        assert!(bpm.fetch_page(PageId::new(99)).unwrap().is_none());
    }

    #[test]
    fn test_delete_page_requires_unpinned() {
        let (bpm, _dir) = create_bpm(10);

        let page_id = bpm.new_page().unwrap().unwrap().page_id();
        assert!(!bpm.delete_page(page_id).unwrap());

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_flush_page_clears_dirty() {
        let (bpm, _dir) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page_write().unwrap().unwrap();
            guard.data_mut()[7] = 9;
            guard.page_id()
        };

        assert!(bpm.flush_page(page_id).unwrap());
        assert!(!bpm.flush_page(PageId::new(500)).unwrap());

        let frame = bpm.fetch_page(page_id).unwrap().unwrap();
        assert!(!frame.is_dirty());
        bpm.unpin_page(page_id, false);
    }
}
