use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::common::FrameId;

struct ReplacerState {
    /// Evictable frames, oldest first-unpin at the front
    queue: VecDeque<FrameId>,
    /// Membership set mirroring `queue`
    members: HashSet<FrameId>,
}

/// LRU replacement policy over buffer frames.
///
/// Frames become eviction candidates when unpinned and stop being candidates
/// when pinned. Victims are handed out strictly in first-unpin order:
/// unpinning a frame that is already a candidate does not move it to the
/// back of the queue.
pub struct LruReplacer {
    /// Maximum number of frames the replacer can track (the pool size)
    capacity: usize,
    state: Mutex<ReplacerState>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ReplacerState {
                queue: VecDeque::with_capacity(capacity),
                members: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Marks a frame as evictable. No-op if it already is; concurrent unpins
    /// of the same frame collapse to a single queue entry.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        if state.members.len() >= self.capacity && !state.members.contains(&frame_id) {
            return;
        }
        if state.members.insert(frame_id) {
            state.queue.push_back(frame_id);
        }
    }

    /// Removes a frame from the evictable set. No-op if absent.
    pub fn pin(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        if state.members.remove(&frame_id) {
            if let Some(pos) = state.queue.iter().position(|&f| f == frame_id) {
                state.queue.remove(pos);
            }
        }
    }

    /// Returns and removes the oldest evictable frame, or None if no frame
    /// is evictable. Never hands the same frame to two callers.
    pub fn victim(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        let frame_id = state.queue.pop_front()?;
        state.members.remove(&frame_id);
        Some(frame_id)
    }

    /// Number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().members.len()
    }
}
