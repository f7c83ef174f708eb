//! The heap orchestrator: blocks in, blocks out.
//!
//! Allocation wraps every request in a block carved from a backing heap.
//! Freeing validates the block, moves it to the quarantine and releases
//! whatever the quarantine evicts. Corruption and double frees are reported
//! to the error sink and never abort the process.

use crate::block::{
    create_block, mark_freed, mark_quarantined, parse_header, user_pointer_to_block_info,
    validate, BlockHeader, BlockInfo, BlockLayout, BlockState, TRAILER_SIZE,
};
use crate::classify::{classify, is_heap_corrupt, ErrorInfo};
use crate::config::Parameters;
use crate::error::{AccessMode, BadAccessKind, Error};
use crate::heap::{BackingHeap, Region, RegionHeap};
use crate::quarantine::{QuarantineEntry, ShardedQuarantine};
use crate::report::ErrorSink;
use crate::shadow::{Shadow, ShadowWalker};
use crate::stack::StackProvider;
use crate::sync::Mutex;
use crate::util::{MAX_ALIGN, MIN_ALIGN};
use core::fmt;
use core::ptr::{self, NonNull};
use std::collections::BTreeMap;
use std::sync::Arc;

type Quarantine = ShardedQuarantine<QuarantineEntry>;

/// Identifies a heap owned by a [`HeapManager`]. Stored in block trailers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapId(pub u32);

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

struct ManagerState {
    heaps: BTreeMap<HeapId, Arc<dyn BackingHeap>>,
    next_heap: u32,
    params: Parameters,
    quarantine: Arc<Quarantine>,
}

/// What an allocate or free needs, copied out of the coarse lock.
struct OpContext {
    backing: Arc<dyn BackingHeap>,
    quarantine: Arc<Quarantine>,
    trailer_padding_size: usize,
    allocation_guard_rate: f32,
}

pub struct HeapManager {
    // Heaps go first so their chunks are returned while the window is mapped.
    state: Mutex<ManagerState>,
    stacks: Arc<dyn StackProvider>,
    sink: Arc<dyn ErrorSink>,
    region: Arc<Region>,
    shadow: Arc<Shadow>,
}

fn new_quarantine(params: &Parameters) -> Arc<Quarantine> {
    Arc::new(ShardedQuarantine::new(
        params.sharding_factor,
        params.quarantine_size,
        params.quarantine_block_size,
    ))
}

impl HeapManager {
    pub fn new(
        shadow: Arc<Shadow>,
        region: Arc<Region>,
        stacks: Arc<dyn StackProvider>,
        sink: Arc<dyn ErrorSink>,
        params: Parameters,
    ) -> HeapManager {
        HeapManager {
            state: Mutex::new(ManagerState {
                heaps: BTreeMap::new(),
                next_heap: 1,
                quarantine: new_quarantine(&params),
                params,
            }),
            stacks,
            sink,
            region,
            shadow,
        }
    }

    pub fn shadow(&self) -> &Arc<Shadow> {
        &self.shadow
    }

    pub fn stacks(&self) -> &Arc<dyn StackProvider> {
        &self.stacks
    }

    pub fn parameters(&self) -> Parameters {
        self.state.lock().params.clone()
    }

    fn quarantine(&self) -> Arc<Quarantine> {
        self.state.lock().quarantine.clone()
    }

    /// Bytes currently held in the quarantine.
    pub fn quarantine_size(&self) -> usize {
        self.quarantine().size()
    }

    /// Blocks currently held in the quarantine.
    pub fn quarantine_len(&self) -> usize {
        self.quarantine().len()
    }

    pub fn heap_ids(&self) -> Vec<HeapId> {
        self.state.lock().heaps.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Heaps
    // ------------------------------------------------------------------

    /// Create a heap drawing from the window's region.
    pub fn create_heap(&self) -> HeapId {
        self.create_heap_with(Box::new(RegionHeap::new(self.region.clone())))
    }

    /// Adopt `backing` as a new heap.
    pub fn create_heap_with(&self, backing: Box<dyn BackingHeap>) -> HeapId {
        let mut state = self.state.lock();
        let id = HeapId(state.next_heap);
        state.next_heap += 1;
        state.heaps.insert(id, Arc::from(backing));
        log::debug!("created {}", id);
        id
    }

    /// Destroy a heap. Its quarantined blocks are released, the rest of the
    /// quarantine is left in place, and its live blocks are unpoisoned and
    /// returned with the backing heap.
    pub fn destroy_heap(&self, id: HeapId) -> Result<(), Error> {
        let (backing, quarantine) = {
            let mut state = self.state.lock();
            let backing = state.heaps.remove(&id).ok_or(Error::UnknownHeap(id.0))?;
            (backing, state.quarantine.clone())
        };

        let mut released = 0;
        for entry in quarantine.empty() {
            let Some(info) = self.entry_info(&entry) else {
                continue;
            };
            // SAFETY: quarantined blocks stay mapped until released.
            let owner = unsafe { info.trailer() }.heap_id;
            if owner == id.0 {
                self.release_block(&info, backing.as_ref());
                released += 1;
            } else if quarantine.push(entry).is_none() {
                self.evict(entry);
            }
        }

        let live: Vec<BlockInfo> = ShadowWalker::heap(&self.shadow, false)
            .filter_map(|c| BlockInfo::from_compact(&c))
            .filter(|info| {
                NonNull::new(info.block as *mut u8).is_some_and(|p| backing.owns(p))
            })
            .collect();
        for info in &live {
            // SAFETY: the block belongs to the heap being torn down.
            let header = unsafe { info.header() };
            self.release_stacks(&header);
            self.shadow.unpoison(info.block, info.block_size);
        }
        log::debug!(
            "destroyed {}: {} quarantined and {} live blocks released",
            id,
            released,
            live.len()
        );
        drop(backing);
        Ok(())
    }

    fn context(&self, heap: HeapId) -> Result<OpContext, Error> {
        let state = self.state.lock();
        let backing = state
            .heaps
            .get(&heap)
            .cloned()
            .ok_or(Error::UnknownHeap(heap.0))?;
        Ok(OpContext {
            backing,
            quarantine: state.quarantine.clone(),
            trailer_padding_size: state.params.trailer_padding_size,
            allocation_guard_rate: state.params.allocation_guard_rate,
        })
    }

    /// The backing heap that owns `info`, trusting the trailer's heap id
    /// first.
    fn backing_for(&self, info: &BlockInfo) -> Option<Arc<dyn BackingHeap>> {
        let ptr = NonNull::new(info.block as *mut u8)?;
        // SAFETY: the block is mapped.
        let heap_id = HeapId(unsafe { info.trailer() }.heap_id);
        let state = self.state.lock();
        if let Some(heap) = state.heaps.get(&heap_id).filter(|h| h.owns(ptr)) {
            return Some(heap.clone());
        }
        state.heaps.values().find(|h| h.owns(ptr)).cloned()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub fn allocate(&self, heap: HeapId, bytes: usize) -> Result<NonNull<u8>, Error> {
        self.allocate_aligned(heap, bytes, MIN_ALIGN)
    }

    pub fn allocate_aligned(
        &self,
        heap: HeapId,
        bytes: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, Error> {
        if !alignment.is_power_of_two() || alignment > MAX_ALIGN {
            return Err(Error::InvalidAlignment(alignment));
        }
        let ctx = self.context(heap)?;

        if ctx.allocation_guard_rate < 1.0
            && alignment <= MIN_ALIGN
            && rand::random::<f32>() >= ctx.allocation_guard_rate
        {
            return ctx.backing.allocate(bytes).ok_or(Error::OutOfMemory(bytes));
        }

        let layout = BlockLayout::plan(bytes, alignment, 0, TRAILER_SIZE + ctx.trailer_padding_size)
            .ok_or(Error::SizeTooLarge(bytes))?;
        let raw = ctx
            .backing
            .allocate(layout.block_size)
            .ok_or(Error::OutOfMemory(bytes))?;
        let start = raw.as_ptr() as usize;
        if !self.shadow.contains(start) || !self.shadow.contains(start + layout.block_size - 1) {
            log::warn!("{} returned {:#x} outside the shadowed window", heap, start);
            ctx.backing.free(raw);
            return Err(Error::OutOfMemory(bytes));
        }

        let alloc_stack = self.stacks.capture();
        // SAFETY: `raw` is a fresh, 8-aligned chunk of `block_size` bytes
        // inside the window.
        let info = unsafe {
            create_block(&self.shadow, raw.as_ptr(), &layout, false, Some(alloc_stack), heap.0)
        };
        NonNull::new(info.body as *mut u8).ok_or(Error::OutOfMemory(bytes))
    }

    /// Usable size of an allocation made from `heap`.
    pub fn size(&self, heap: HeapId, ptr: NonNull<u8>) -> Option<usize> {
        match user_pointer_to_block_info(&self.shadow, ptr.as_ptr() as usize) {
            Some(info) => {
                // SAFETY: located through the shadow, hence mapped.
                let header = unsafe { info.header() };
                (header.state() == Some(BlockState::Allocated)).then_some(info.body_size)
            }
            None => self.context(heap).ok()?.backing.size(ptr),
        }
    }

    /// Allocate `bytes`, copy the old contents over and free `ptr`.
    pub fn realloc(
        &self,
        heap: HeapId,
        ptr: Option<NonNull<u8>>,
        bytes: usize,
    ) -> Result<NonNull<u8>, Error> {
        let Some(old) = ptr else {
            return self.allocate(heap, bytes);
        };
        let old_size = self
            .size(heap, old)
            .ok_or(Error::InvalidPointer(old.as_ptr() as usize))?;
        // A corrupt block is reported and released before anything is
        // allocated, so a failed realloc leaves nothing behind.
        let addr = old.as_ptr() as usize;
        if let Some(info) = user_pointer_to_block_info(&self.shadow, addr) {
            // SAFETY: located through the shadow, hence mapped.
            if unsafe { validate(&info) }.is_err() {
                return self.free(heap, old.as_ptr()).and(Err(Error::CorruptBlock(addr)));
            }
        }
        let new = self.allocate(heap, bytes)?;
        // SAFETY: both ranges are live allocations of at least the copied size.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(bytes)) };
        self.free(heap, old.as_ptr())?;
        Ok(new)
    }

    // ------------------------------------------------------------------
    // Free
    // ------------------------------------------------------------------

    /// Free `ptr`. Null is a no-op.
    ///
    /// A corrupt block is reported, sanitized and released anyway; the call
    /// then returns [`Error::CorruptBlock`]. A block that is not allocated is
    /// reported as a double free and left alone.
    pub fn free(&self, heap: HeapId, ptr: *mut u8) -> Result<(), Error> {
        let Some(nn) = NonNull::new(ptr) else {
            return Ok(());
        };
        let addr = ptr as usize;
        let ctx = self.context(heap)?;

        let Some(info) = user_pointer_to_block_info(&self.shadow, addr) else {
            if ctx.backing.free(nn) {
                return Ok(());
            }
            log::warn!("free of {addr:#x} which is not a block of {heap}");
            return Err(Error::InvalidPointer(addr));
        };

        // SAFETY: located through the shadow, hence mapped.
        if let Err(corruption) = unsafe { validate(&info) } {
            log::warn!("freeing corrupt block {:#x}: {}", info.block, corruption);
            self.report_block_error(BadAccessKind::CorruptBlock, addr, &info);
            self.release_corrupt(&info, &ctx.quarantine);
            return Err(Error::CorruptBlock(addr));
        }

        // SAFETY: as above.
        let header = unsafe { info.header() };
        if header.state() != Some(BlockState::Allocated) {
            log::warn!("double free of {addr:#x}");
            self.report_block_error(BadAccessKind::DoubleFree, addr, &info);
            return Err(Error::DoubleFree(addr));
        }

        let free_stack = self.stacks.capture();
        // SAFETY: the block is allocated and the caller gave it up.
        unsafe { mark_quarantined(&self.shadow, &info, Some(free_stack)) };
        let entry = QuarantineEntry {
            block: info.block,
            size: info.block_size,
        };
        match ctx.quarantine.push(entry) {
            Some(shard) => {
                log::trace!("quarantined {:#x} in shard {}", info.block, shard);
                ctx.quarantine.trim(shard, |evicted| self.evict(evicted));
            }
            None => match self.backing_for(&info) {
                Some(owner) => self.release_block(&info, owner.as_ref()),
                None => log::warn!("no heap owns block {:#x}, leaking it", info.block),
            },
        }
        Ok(())
    }

    /// Geometry of a quarantined block, from its header if that is intact and
    /// from the shadow otherwise.
    fn entry_info(&self, entry: &QuarantineEntry) -> Option<BlockInfo> {
        // SAFETY: quarantined blocks stay mapped; parsing stops at the window end.
        unsafe { parse_header(entry.block, self.shadow.end()) }
            .filter(|info| info.block_size == entry.size)
            .or_else(|| {
                let compact = self.shadow.block_info_from_shadow(entry.block)?;
                BlockInfo::from_compact(&compact).filter(|info| info.block == entry.block)
            })
    }

    /// Release a block leaving the quarantine.
    fn evict(&self, entry: QuarantineEntry) {
        let Some(info) = self.entry_info(&entry) else {
            log::warn!("quarantined block {:#x} is unreadable, leaking it", entry.block);
            return;
        };
        // SAFETY: still owned by the quarantine until released below.
        if let Err(corruption) = unsafe { validate(&info) } {
            log::warn!("quarantined block {:#x} was modified: {}", info.block, corruption);
            self.report_block_error(BadAccessKind::CorruptBlock, info.body, &info);
        }
        match self.backing_for(&info) {
            Some(backing) => self.release_block(&info, backing.as_ref()),
            None => log::warn!("no heap owns quarantined block {:#x}", info.block),
        }
    }

    /// Drop the stack references a header holds. Ids the provider does not
    /// know are skipped.
    fn release_stacks(&self, header: &BlockHeader) {
        for id in [header.alloc_stack(), header.free_stack()].into_iter().flatten() {
            if self.stacks.contains(id) {
                self.stacks.release(id);
            }
        }
    }

    /// Final release: mark freed, drop stack references, unpoison and give
    /// the memory back.
    fn release_block(&self, info: &BlockInfo, backing: &dyn BackingHeap) {
        // SAFETY: the caller owns the block and it is mapped.
        let header = unsafe {
            mark_freed(info);
            info.header()
        };
        self.release_stacks(&header);
        self.shadow.unpoison(info.block, info.block_size);
        if let Some(ptr) = NonNull::new(info.block as *mut u8) {
            if !backing.free(ptr) {
                log::warn!("backing heap refused block {:#x}", info.block);
            }
        }
    }

    /// Sanitize and release a block that failed validation.
    fn release_corrupt(&self, info: &BlockInfo, quarantine: &Quarantine) {
        let info = self
            .shadow
            .block_info_from_shadow(info.block)
            .and_then(|c| BlockInfo::from_compact(&c))
            .filter(|c| c.block == info.block)
            .unwrap_or(*info);
        quarantine.remove(&QuarantineEntry {
            block: info.block,
            size: info.block_size,
        });
        // Already returned to its heap means nothing is left to release.
        let Some(backing) = self.backing_for(&info) else {
            log::warn!("corrupt block {:#x} has no owning heap", info.block);
            return;
        };
        // SAFETY: the block is owned by `backing`, hence mapped.
        let header = unsafe { &mut *info.header_ptr() };
        self.release_stacks(header);
        header.set_alloc_stack(None);
        header.set_free_stack(None);
        self.shadow.unpoison(info.block, info.block_size);
        if let Some(ptr) = NonNull::new(info.block as *mut u8) {
            backing.free(ptr);
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Install new parameters. Shrinking the quarantine evicts right away; a
    /// new sharding factor rebuilds it.
    pub fn set_parameters(&self, mut params: Parameters) -> Result<(), Error> {
        params.validate()?;
        let (current, retired) = {
            let mut state = self.state.lock();
            let retired = if params.sharding_factor != state.params.sharding_factor {
                let old = core::mem::replace(&mut state.quarantine, new_quarantine(&params));
                Some(old)
            } else {
                state.quarantine.set_max_quarantine_size(params.quarantine_size);
                state.quarantine.set_max_object_size(params.quarantine_block_size);
                None
            };
            state.params = params;
            (state.quarantine.clone(), retired)
        };
        log::debug!("parameters updated");

        if let Some(old) = retired {
            for entry in old.empty() {
                if current.push(entry).is_none() {
                    self.evict(entry);
                }
            }
        }
        let mut evicted = 0;
        while let Some(entry) = current.pop() {
            self.evict(entry);
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("evicted {} blocks after shrinking the quarantine", evicted);
        }
        Ok(())
    }

    /// Release every quarantined block.
    pub fn flush_quarantine(&self) {
        for entry in self.quarantine().empty() {
            self.evict(entry);
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Diagnose a faulting access and hand it to the sink.
    pub fn report_heap_error(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        let mut error = classify(&self.shadow, addr);
        error.access_mode = mode;
        error.access_size = size;
        self.dispatch(error)
    }

    fn report_block_error(&self, kind: BadAccessKind, addr: usize, info: &BlockInfo) {
        self.dispatch(ErrorInfo::new(kind, addr).with_block(info));
    }

    fn dispatch(&self, mut error: ErrorInfo) -> ErrorInfo {
        let crash_stack = self.stacks.capture();
        error.crash_stack = Some(crash_stack);
        let (check_heap, ignored) = {
            let state = self.state.lock();
            (state.params.check_heap_on_failure, state.params.is_ignored(crash_stack))
        };
        if check_heap {
            error.corrupt_ranges = is_heap_corrupt(&self.shadow);
            error.heap_is_corrupt = !error.corrupt_ranges.is_empty();
        }
        error.shadow_text = self.shadow.shadow_text(error.location);
        if ignored {
            log::debug!("ignoring {} at {:#x}", error.kind, error.location);
        } else {
            self.sink.report(&error);
        }
        self.stacks.release(crash_stack);
        error
    }
}

impl Drop for HeapManager {
    fn drop(&mut self) {
        self.flush_quarantine();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingSink;
    use crate::stack::StackCache;

    struct Fixture {
        manager: HeapManager,
        sink: Arc<RecordingSink>,
        stacks: Arc<StackCache>,
        heap: HeapId,
    }

    fn fixture(options: &str) -> Fixture {
        let params = Parameters::parse(options).unwrap();
        let shadow = Arc::new(Shadow::setup(16 << 20).unwrap());
        let region = Arc::new(Region::new(shadow.heap_bounds()));
        let stacks = Arc::new(StackCache::new(8, 0));
        let sink = Arc::new(RecordingSink::new());
        let manager = HeapManager::new(shadow, region, stacks.clone(), sink.clone(), params);
        let heap = manager.create_heap();
        Fixture {
            manager,
            sink,
            stacks,
            heap,
        }
    }

    #[test]
    fn allocation_is_aligned_and_bounded() {
        let f = fixture("");
        let s = f.manager.shadow().clone();
        for (size, align) in [(0, 8), (1, 8), (100, 16), (4096, 4096), (33, 256)] {
            let p = f.manager.allocate_aligned(f.heap, size, align).unwrap();
            let addr = p.as_ptr() as usize;
            assert_eq!(addr % align, 0);
            assert!(s.is_range_accessible(addr, size));
            assert!(!s.is_accessible(addr - 1));
            assert!(!s.is_accessible(addr + size));
            assert_eq!(f.manager.size(f.heap, p), Some(size));
        }
        assert!(matches!(
            f.manager.allocate_aligned(f.heap, 8, 24),
            Err(Error::InvalidAlignment(24))
        ));
        assert!(matches!(
            f.manager.allocate(HeapId(99), 8),
            Err(Error::UnknownHeap(99))
        ));
    }

    #[test]
    fn free_quarantines_then_releases() {
        let f = fixture("--quarantine_size=4096 --sharding_factor=1");
        let p = f.manager.allocate(f.heap, 100).unwrap();
        let addr = p.as_ptr() as usize;
        f.manager.free(f.heap, p.as_ptr()).unwrap();
        assert_eq!(f.manager.quarantine_len(), 1);
        assert!(!f.manager.shadow().is_accessible(addr));
        assert_eq!(f.manager.size(f.heap, p), None);

        f.manager.flush_quarantine();
        assert_eq!(f.manager.quarantine_len(), 0);
        assert!(f.manager.shadow().is_accessible(addr));
        assert!(f.stacks.is_empty());
        assert!(f.sink.is_empty());
    }

    #[test]
    fn double_free_is_reported_once() {
        let f = fixture("--sharding_factor=1");
        let p = f.manager.allocate(f.heap, 32).unwrap();
        f.manager.free(f.heap, p.as_ptr()).unwrap();
        assert!(matches!(
            f.manager.free(f.heap, p.as_ptr()),
            Err(Error::DoubleFree(_))
        ));
        let reports = f.sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, BadAccessKind::DoubleFree);
        assert_eq!(f.manager.quarantine_len(), 1);
    }

    #[test]
    fn unknown_pointers_are_rejected() {
        let f = fixture("");
        let p = f.manager.allocate(f.heap, 64).unwrap();
        let inside = unsafe { p.as_ptr().add(8) };
        assert!(matches!(
            f.manager.free(f.heap, inside),
            Err(Error::InvalidPointer(_))
        ));
        assert!(f.manager.free(f.heap, ptr::null_mut()).is_ok());
    }

    #[test]
    fn unquarantined_blocks_return_to_their_owning_heap() {
        let f = fixture("--quarantine_size=0");
        let other = f.manager.create_heap();
        let p = f.manager.allocate(f.heap, 64).unwrap();
        let block = user_pointer_to_block_info(f.manager.shadow(), p.as_ptr() as usize)
            .map(|info| NonNull::new(info.block as *mut u8).unwrap())
            .unwrap();

        f.manager.free(other, p.as_ptr()).unwrap();
        assert_eq!(f.manager.quarantine_len(), 0);
        assert_eq!(f.manager.size(f.heap, block), None);
        assert_eq!(f.manager.size(other, block), None);
        // The chunk went back to the region and is handed out again.
        let q = f.manager.allocate(f.heap, 64).unwrap();
        assert_eq!(q, p);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn realloc_of_corrupt_block_allocates_nothing() {
        let f = fixture("");
        let p = f.manager.allocate(f.heap, 16).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr().add(16), 0x41, 8) };
        assert!(matches!(
            f.manager.realloc(f.heap, Some(p), 64),
            Err(Error::CorruptBlock(_))
        ));
        let reports = f.sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, BadAccessKind::CorruptBlock);
        assert_eq!(ShadowWalker::heap(f.manager.shadow(), true).count(), 0);
        assert_eq!(f.manager.quarantine_len(), 0);
        assert!(f.stacks.is_empty());
    }

    #[test]
    fn oversized_blocks_skip_the_quarantine() {
        let f = fixture("--quarantine_size=65536 --quarantine_block_size=256");
        let p = f.manager.allocate(f.heap, 1000).unwrap();
        f.manager.free(f.heap, p.as_ptr()).unwrap();
        assert_eq!(f.manager.quarantine_len(), 0);
        assert!(f.manager.shadow().is_accessible(p.as_ptr() as usize));
    }

    #[test]
    fn corrupt_block_is_sanitized_on_free() {
        let f = fixture("");
        let p = f.manager.allocate(f.heap, 16).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr().add(16), 0x41, 8) };
        assert!(matches!(
            f.manager.free(f.heap, p.as_ptr()),
            Err(Error::CorruptBlock(_))
        ));
        let reports = f.sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, BadAccessKind::CorruptBlock);
        assert!(reports[0].heap_is_corrupt);
        assert_eq!(f.manager.quarantine_len(), 0);
        assert!(f.manager.shadow().is_accessible(p.as_ptr() as usize - 16));
        assert!(f.stacks.is_empty());
    }

    #[test]
    fn write_after_free_is_caught_at_eviction() {
        let f = fixture("--quarantine_size=4096 --sharding_factor=1");
        let p = f.manager.allocate(f.heap, 64).unwrap();
        f.manager.free(f.heap, p.as_ptr()).unwrap();
        unsafe { *p.as_ptr() ^= 0xFF };
        f.manager.flush_quarantine();
        let reports = f.sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, BadAccessKind::CorruptBlock);
    }

    #[test]
    fn realloc_copies_and_frees() {
        let f = fixture("");
        let p = f.manager.allocate(f.heap, 8).unwrap();
        unsafe { ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), p.as_ptr(), 8) };
        let q = f.manager.realloc(f.heap, Some(p), 64).unwrap();
        assert_eq!(unsafe { core::slice::from_raw_parts(q.as_ptr(), 8) }, b"abcdefgh");
        assert_eq!(f.manager.size(f.heap, q), Some(64));
        assert_eq!(f.manager.size(f.heap, p), None);
        let r = f.manager.realloc(f.heap, None, 3).unwrap();
        assert_eq!(f.manager.size(f.heap, r), Some(3));
    }

    #[test]
    fn guard_rate_zero_bypasses_blocks() {
        let f = fixture("--allocation_guard_rate=0");
        let p = f.manager.allocate(f.heap, 40).unwrap();
        assert!(user_pointer_to_block_info(f.manager.shadow(), p.as_ptr() as usize).is_none());
        assert_eq!(f.manager.size(f.heap, p), Some(48));
        f.manager.free(f.heap, p.as_ptr()).unwrap();
        assert_eq!(f.manager.quarantine_len(), 0);
    }

    #[test]
    fn ignored_stacks_are_not_reported() {
        let f = fixture("");
        let p = f.manager.allocate(f.heap, 100).unwrap();
        let addr = p.as_ptr() as usize + 100;
        let e = f.manager.report_heap_error(addr, AccessMode::Read, 1);
        assert_eq!(e.kind, BadAccessKind::Overflow);
        assert!(!e.shadow_text.is_empty());
        assert_eq!(f.sink.take().len(), 1);

        // Stack ids derive from the frames, so reporting again from the same
        // call site yields the same crash stack.
        let mut crash_stack = None;
        for round in 0..2 {
            let e = f.manager.report_heap_error(addr, AccessMode::Read, 1);
            if round == 0 {
                crash_stack = e.crash_stack;
                let mut params = f.manager.parameters();
                params.ignored_stack_ids.insert(crash_stack.unwrap().get());
                f.manager.set_parameters(params).unwrap();
            } else {
                assert_eq!(e.crash_stack, crash_stack);
            }
        }
        assert_eq!(f.sink.take().len(), 1);
    }
}
