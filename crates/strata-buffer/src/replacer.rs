//! Page replacement policies for the buffer cache.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned) or not.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction and removes it from the evictable set.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Clock replacement.
///
/// The hand sweeps the frames in order. An evictable frame with a cleared
/// reference bit is the victim; a set bit is cleared and the frame skipped
/// once (second chance).
pub struct ClockReplacer {
    inner: Mutex<ClockState>,
}

struct ClockState {
    num_frames: usize,
    reference_bits: Vec<bool>,
    evictable: HashSet<FrameId>,
    hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState {
                num_frames,
                reference_bits: vec![false; num_frames],
                evictable: HashSet::new(),
                hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().num_frames
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if frame_id.index() < inner.num_frames {
            inner.reference_bits[frame_id.index()] = true;
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        if frame_id.index() >= inner.num_frames {
            return;
        }
        if evictable {
            inner.evictable.insert(frame_id);
        } else {
            inner.evictable.remove(&frame_id);
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable.is_empty() {
            return None;
        }

        // Two sweeps always suffice: the first clears every reference bit.
        for _ in 0..(2 * inner.num_frames) {
            let hand = inner.hand;
            let frame_id = FrameId(hand as u32);
            inner.hand = (hand + 1) % inner.num_frames;

            if !inner.evictable.contains(&frame_id) {
                continue;
            }
            if inner.reference_bits[hand] {
                inner.reference_bits[hand] = false;
            } else {
                inner.evictable.remove(&frame_id);
                return Some(frame_id);
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if frame_id.index() < inner.num_frames {
            inner.evictable.remove(&frame_id);
            inner.reference_bits[frame_id.index()] = false;
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable.len()
    }
}
