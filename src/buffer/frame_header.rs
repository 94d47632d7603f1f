use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// FrameHeader is one slot of the buffer pool: the page image plus the
/// metadata needed to track it.
///
/// The image sits behind a reader/writer lock which doubles as the per-page
/// latch. Callers (or the RAII page guards) take it around their logical
/// critical sections; its acquire/release semantics make writes published
/// under the write latch visible to later read-latch holders. The buffer
/// pool itself only moves whole images in and out and never interprets the
/// payload.
pub struct FrameHeader {
    /// Index of this frame in the pool, fixed for its lifetime
    frame_id: FrameId,
    /// Which page currently lives here; INVALID_PAGE_ID when empty
    page_id: Mutex<PageId>,
    /// Number of callers currently holding this frame
    pin_count: AtomicU32,
    /// Set when the image diverges from what is on disk
    is_dirty: AtomicBool,
    /// The page image, guarded by the page latch
    pub(crate) data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: Mutex::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        *self.page_id.lock()
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        *self.page_id.lock() = page_id;
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Takes one more reference to the frame; returns the new pin count.
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Gives one reference back. Returns the new pin count, or None when the
    /// count was already zero (an unmatched unpin).
    pub(crate) fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Takes the page latch in read mode.
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Takes the page latch in write mode.
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Replaces the page image with `data`.
    pub(crate) fn copy_from(&self, data: &[u8]) {
        self.data.write().copy_from_slice(data);
    }

    /// Snapshots the page image into `data`.
    pub(crate) fn copy_to(&self, data: &mut [u8]) {
        data.copy_from_slice(&self.data.read()[..]);
    }

    /// Returns the frame to its empty state. The buffer pool only calls this
    /// while no caller holds a pin.
    pub(crate) fn reset(&self) {
        *self.page_id.lock() = INVALID_PAGE_ID;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_frame_is_empty() {
        let frame = FrameHeader::new(FrameId::new(3));
        assert_eq!(frame.frame_id(), FrameId::new(3));
        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_pin_counting() {
        let frame = FrameHeader::new(FrameId::new(0));

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.unpin(), Some(1));
        assert_eq!(frame.unpin(), Some(0));
        // the count never goes below zero
        assert_eq!(frame.unpin(), None);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_image_round_trip() {
        let frame = FrameHeader::new(FrameId::new(0));

        let mut image = [0u8; PAGE_SIZE];
        image[0] = 42;
        image[PAGE_SIZE - 1] = 7;
        frame.copy_from(&image);

        let mut out = [0u8; PAGE_SIZE];
        frame.copy_to(&mut out);
        assert_eq!(out[0], 42);
        assert_eq!(out[PAGE_SIZE - 1], 7);
    }

    #[test]
    fn test_reset_clears_everything() {
        let frame = FrameHeader::new(FrameId::new(0));

        frame.set_page_id(PageId::new(5));
        frame.pin();
        frame.set_dirty(true);
        frame.copy_from(&[1u8; PAGE_SIZE]);

        frame.reset();

        assert_eq!(frame.page_id(), INVALID_PAGE_ID);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(frame.read_data().iter().all(|&b| b == 0));
    }
}
