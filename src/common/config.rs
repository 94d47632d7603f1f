use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::{FrameId, PageId};

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID of the header page, always the first page in the database file
pub const HEADER_PAGE_ID: PageId = PageId::new(0);

/// Invalid page ID constant
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Invalid frame ID constant
pub const INVALID_FRAME_ID: FrameId = FrameId(u32::MAX);

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 10;

/// Default B+tree fan-outs, used when a tree is built without explicit sizes
pub const DEFAULT_LEAF_MAX_SIZE: usize = 32;
pub const DEFAULT_INTERNAL_MAX_SIZE: usize = 32;

static CYCLE_DETECTION_INTERVAL_MS: AtomicU64 = AtomicU64::new(50);

/// Process-wide interval between deadlock detection runs.
///
/// Tests shrink or grow this to control how quickly a cycle is broken; the
/// detector thread re-reads it on every tick, so updates take effect without
/// a restart.
pub struct CycleDetectionInterval;

impl CycleDetectionInterval {
    pub fn get() -> Duration {
        Duration::from_millis(CYCLE_DETECTION_INTERVAL_MS.load(Ordering::Relaxed))
    }

    pub fn set(interval: Duration) {
        CYCLE_DETECTION_INTERVAL_MS.store(interval.as_millis() as u64, Ordering::Relaxed);
    }
}
