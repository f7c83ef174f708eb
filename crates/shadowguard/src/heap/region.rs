use super::size_class::{size_class_index, slot_size, NUM_SIZE_CLASSES};
use super::BackingHeap;
use crate::platform;
use crate::sync::Mutex;
use crate::util::{align_up, MIN_ALIGN};
use ahash::AHashMap;
use core::ops::Range;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::Arc;

struct RegionInner {
    cursor: usize,
    small: [Vec<usize>; NUM_SIZE_CLASSES],
    /// Page-granular chunks by size.
    large: BTreeMap<usize, Vec<usize>>,
    in_use: usize,
}

/// Chunk allocator over the heap area of the shadowed window.
///
/// Small requests are rounded to a size class and recycled through per-class
/// free lists. Large requests are page-granular and their pages are returned
/// to the kernel on release. Fresh memory comes from a bump pointer that never
/// moves back.
pub struct Region {
    bounds: Range<usize>,
    page_size: usize,
    inner: Mutex<RegionInner>,
}

impl Region {
    pub fn new(bounds: Range<usize>) -> Region {
        let start = align_up(bounds.start, MIN_ALIGN);
        Region {
            bounds: start..bounds.end,
            page_size: platform::page_size(),
            inner: Mutex::new(RegionInner {
                cursor: start,
                small: core::array::from_fn(|_| Vec::new()),
                large: BTreeMap::new(),
                in_use: 0,
            }),
        }
    }

    pub fn bounds(&self) -> Range<usize> {
        self.bounds.clone()
    }

    /// Bytes handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Size of the chunk a request of `bytes` is served with.
    pub fn chunk_size(&self, bytes: usize) -> usize {
        match size_class_index(bytes) {
            Some(class) => slot_size(class),
            None => align_up(bytes, self.page_size),
        }
    }

    /// Carve a chunk of at least `bytes`. Returns the chunk and its size.
    pub fn allocate(&self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        if bytes > self.bounds.len() {
            return None;
        }
        let chunk = self.chunk_size(bytes);
        let mut inner = self.inner.lock();
        let (addr, size) = match size_class_index(bytes) {
            Some(class) => match inner.small[class].pop() {
                Some(addr) => (addr, chunk),
                None => (bump(&mut inner, &self.bounds, chunk, MIN_ALIGN)?, chunk),
            },
            None => {
                // Reuse a free chunk unless it would waste more than half.
                let reusable = inner
                    .large
                    .range(chunk..=chunk.saturating_mul(2))
                    .next()
                    .map(|(&size, _)| size);
                let recycled = reusable.and_then(|size| {
                    let list = inner.large.get_mut(&size)?;
                    let addr = list.pop()?;
                    if list.is_empty() {
                        inner.large.remove(&size);
                    }
                    Some((addr, size))
                });
                match recycled {
                    Some(found) => found,
                    None => (bump(&mut inner, &self.bounds, chunk, self.page_size)?, chunk),
                }
            }
        };
        inner.in_use += size;
        NonNull::new(addr as *mut u8).map(|p| (p, size))
    }

    /// Return a chunk obtained from [`Region::allocate`].
    ///
    /// # Safety
    /// `ptr` and `size` must come from one `allocate` call on this region and
    /// the chunk must not be used afterwards.
    pub unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;
        let small = size_class_index(size).filter(|&c| slot_size(c) == size);
        if small.is_none() {
            platform::discard_pages(addr, size);
        }
        let mut inner = self.inner.lock();
        inner.in_use -= size;
        match small {
            Some(class) => inner.small[class].push(addr),
            None => inner.large.entry(size).or_default().push(addr),
        }
    }
}

fn bump(inner: &mut RegionInner, bounds: &Range<usize>, size: usize, align: usize) -> Option<usize> {
    let addr = align_up(inner.cursor, align);
    let end = addr.checked_add(size)?;
    if end > bounds.end {
        log::warn!("region exhausted serving {} bytes", size);
        return None;
    }
    inner.cursor = end;
    Some(addr)
}

/// A [`BackingHeap`] drawing from a shared [`Region`].
///
/// Each heap remembers its own live chunks, so that dropping it returns them
/// to the region.
pub struct RegionHeap {
    region: Arc<Region>,
    live: Mutex<AHashMap<usize, usize>>,
}

impl RegionHeap {
    pub fn new(region: Arc<Region>) -> RegionHeap {
        RegionHeap {
            region,
            live: Mutex::new(AHashMap::new()),
        }
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl BackingHeap for RegionHeap {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let (ptr, size) = self.region.allocate(bytes)?;
        self.live.lock().insert(ptr.as_ptr() as usize, size);
        Some(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> bool {
        let Some(size) = self.live.lock().remove(&(ptr.as_ptr() as usize)) else {
            return false;
        };
        // SAFETY: the chunk was handed out by this region and is no longer live.
        unsafe { self.region.release(ptr, size) };
        true
    }

    fn size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.live.lock().get(&(ptr.as_ptr() as usize)).copied()
    }
}

impl Drop for RegionHeap {
    fn drop(&mut self) {
        let live = core::mem::take(self.live.get_mut());
        if !live.is_empty() {
            log::debug!("returning {} live chunks to the region", live.len());
        }
        for (addr, size) in live {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every entry of `live` is an outstanding chunk.
                unsafe { self.region.release(ptr, size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::tests::test_shadow;

    #[test]
    fn small_chunks_are_recycled_by_class() {
        let s = test_shadow();
        let region = Region::new(s.heap_bounds());
        let (a, size) = region.allocate(100).unwrap();
        assert_eq!(size, 112);
        assert_eq!(a.as_ptr() as usize % MIN_ALIGN, 0);
        assert!(region.bounds().contains(&(a.as_ptr() as usize)));
        unsafe { region.release(a, size) };
        let (b, _) = region.allocate(97).unwrap();
        assert_eq!(a, b);
        assert_eq!(region.in_use(), 112);
    }

    #[test]
    fn large_chunks_are_page_granular() {
        let s = test_shadow();
        let region = Region::new(s.heap_bounds());
        let page = platform::page_size();
        let (a, size) = region.allocate(20_000).unwrap();
        assert_eq!(size % page, 0);
        assert_eq!(a.as_ptr() as usize % page, 0);
        unsafe {
            a.as_ptr().write_bytes(0xAA, size);
            region.release(a, size);
        }
        let (b, reused) = region.allocate(20_000).unwrap();
        assert_eq!((a, size), (b, reused));
    }

    #[test]
    fn exhaustion_returns_none() {
        let s = test_shadow();
        let region = Region::new(s.heap_bounds());
        let len = region.bounds().len();
        assert!(region.allocate(len + 1).is_none());
        let mut count = 0;
        while region.allocate(1 << 16).is_some() {
            count += 1;
        }
        assert!(count > 0);
        assert!(region.allocate(1 << 16).is_none());
    }

    #[test]
    fn heap_tracks_and_returns_live_chunks() {
        let s = test_shadow();
        let region = Arc::new(Region::new(s.heap_bounds()));
        let heap = RegionHeap::new(region.clone());
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(5000).unwrap();
        assert_eq!(heap.size(a), Some(64));
        assert!(heap.owns(b));
        assert!(heap.free(a));
        assert!(!heap.free(a));
        assert_eq!(heap.live_count(), 1);

        let other = RegionHeap::new(region.clone());
        assert!(!other.owns(b));
        drop(heap);
        assert_eq!(region.in_use(), 0);
    }
}
