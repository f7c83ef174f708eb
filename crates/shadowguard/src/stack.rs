//! Allocation and free sites, deduplicated and reference counted.
//!
//! Block headers only hold a 32-bit [`StackId`]. Every header that names a
//! stack owns one reference to its record; the record disappears when the
//! last block naming it is released.

use crate::sync::Mutex;
use ahash::{AHashMap, RandomState};
use core::fmt;
use core::num::NonZeroU32;

/// Handle to a captured stack. Zero is reserved for "none" in block headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId(NonZeroU32);

impl StackId {
    #[inline]
    pub const fn new(raw: NonZeroU32) -> Self {
        StackId(raw)
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Option<StackId> {
        NonZeroU32::new(raw).map(StackId)
    }

    #[inline]
    pub fn to_raw(id: Option<StackId>) -> u32 {
        id.map_or(0, |id| id.0.get())
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackId({:#010x})", self.0)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Source of stack ids for block provenance.
pub trait StackProvider: Send + Sync {
    /// Capture the calling thread's stack. The caller owns one reference.
    fn capture(&self) -> StackId;
    fn add_ref(&self, id: StackId);
    fn release(&self, id: StackId);
    fn frames_of(&self, id: StackId) -> Option<Vec<usize>>;
    /// Whether `id` names a live record.
    fn contains(&self, id: StackId) -> bool;
}

struct StackRecord {
    frames: Box<[usize]>,
    ref_count: usize,
}

/// Fixed seeds, so that a given frame list maps to the same id in every run
/// of the same binary.
const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// The default [`StackProvider`].
pub struct StackCache {
    max_num_frames: usize,
    bottom_frames_to_skip: usize,
    hasher: RandomState,
    inner: Mutex<AHashMap<StackId, StackRecord>>,
}

/// Frames belonging to the capture machinery itself.
#[cfg(feature = "stack-capture")]
const INTERNAL_FRAMES: usize = 2;

impl StackCache {
    pub fn new(max_num_frames: usize, bottom_frames_to_skip: usize) -> Self {
        StackCache {
            max_num_frames,
            bottom_frames_to_skip,
            hasher: RandomState::with_seeds(
                HASH_SEEDS[0],
                HASH_SEEDS[1],
                HASH_SEEDS[2],
                HASH_SEEDS[3],
            ),
            inner: Mutex::new(AHashMap::new()),
        }
    }

    #[cfg(feature = "stack-capture")]
    #[inline(never)]
    fn walk(&self) -> Vec<usize> {
        let mut frames = Vec::with_capacity(self.max_num_frames);
        let mut skip = INTERNAL_FRAMES;
        backtrace::trace(|frame| {
            if skip > 0 {
                skip -= 1;
                return true;
            }
            frames.push(frame.ip() as usize);
            frames.len() < self.max_num_frames
        });
        let keep = frames.len().saturating_sub(self.bottom_frames_to_skip);
        frames.truncate(keep);
        frames
    }

    #[cfg(not(feature = "stack-capture"))]
    fn walk(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Intern a frame list, returning an id holding one new reference.
    ///
    /// The id is derived from the frame hash; colliding lists probe upwards.
    pub fn intern(&self, frames: &[usize]) -> StackId {
        let hash = self.hasher.hash_one(frames);
        let mut raw = (hash as u32) ^ ((hash >> 32) as u32);
        let mut records = self.inner.lock();
        loop {
            let Some(id) = StackId::from_raw(raw) else {
                raw = 1;
                continue;
            };
            match records.get_mut(&id) {
                Some(record) if *record.frames == *frames => {
                    record.ref_count += 1;
                    return id;
                }
                Some(_) => raw = raw.wrapping_add(1),
                None => {
                    records.insert(
                        id,
                        StackRecord {
                            frames: frames.into(),
                            ref_count: 1,
                        },
                    );
                    return id;
                }
            }
        }
    }

    pub fn ref_count(&self, id: StackId) -> usize {
        self.inner.lock().get(&id).map_or(0, |r| r.ref_count)
    }

    /// Number of distinct live stacks.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StackCache {
    fn default() -> Self {
        StackCache::new(crate::util::DEFAULT_MAX_NUM_FRAMES, 0)
    }
}

impl StackProvider for StackCache {
    fn capture(&self) -> StackId {
        let frames = self.walk();
        self.intern(&frames)
    }

    fn add_ref(&self, id: StackId) {
        match self.inner.lock().get_mut(&id) {
            Some(record) => record.ref_count += 1,
            None => log::warn!("add_ref on unknown stack {}", id),
        }
    }

    fn release(&self, id: StackId) {
        let mut records = self.inner.lock();
        let Some(record) = records.get_mut(&id) else {
            log::warn!("release of unknown stack {}", id);
            return;
        };
        record.ref_count -= 1;
        if record.ref_count == 0 {
            records.remove(&id);
        }
    }

    fn frames_of(&self, id: StackId) -> Option<Vec<usize>> {
        self.inner.lock().get(&id).map(|r| r.frames.to_vec())
    }

    fn contains(&self, id: StackId) -> bool {
        self.inner.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_frames_share_a_record() {
        let cache = StackCache::new(16, 0);
        let a = cache.intern(&[1, 2, 3]);
        let b = cache.intern(&[1, 2, 3]);
        let c = cache.intern(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.ref_count(a), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.frames_of(c), Some(vec![1, 2, 4]));
    }

    #[test]
    fn last_release_drops_record() {
        let cache = StackCache::new(16, 0);
        let id = cache.intern(&[7]);
        cache.add_ref(id);
        cache.release(id);
        assert!(cache.contains(id));
        cache.release(id);
        assert!(!cache.contains(id));
        assert_eq!(cache.frames_of(id), None);
        // Releasing an unknown id is logged and ignored.
        cache.release(id);
        assert!(cache.is_empty());
    }

    #[cfg(feature = "stack-capture")]
    #[test]
    fn capture_respects_frame_limit() {
        let cache = StackCache::new(4, 0);
        let id = cache.capture();
        let frames = cache.frames_of(id).unwrap();
        assert!(!frames.is_empty() && frames.len() <= 4);
    }

    #[test]
    fn ids_are_stable_across_record_lifetimes() {
        let cache = StackCache::new(16, 0);
        let a = cache.intern(&[0x1000, 0x2000]);
        cache.release(a);
        assert!(cache.is_empty());
        let b = cache.intern(&[0x1000, 0x2000]);
        assert_eq!(a, b);
        assert_eq!(StackCache::new(16, 0).intern(&[0x1000, 0x2000]), a);
    }

    #[test]
    fn raw_round_trip() {
        assert_eq!(StackId::from_raw(0), None);
        let id = StackId::from_raw(42).unwrap();
        assert_eq!(StackId::to_raw(Some(id)), 42);
        assert_eq!(StackId::to_raw(None), 0);
    }
}
