//! Instrumented block layout.
//!
//! ```text
//! | header | header padding | body | trailer padding | trailer |
//! ^block                    ^body                               ^block + block_size
//! ```
//!
//! The block start and end are 8-byte aligned, the body is aligned to the
//! requested alignment. Header padding stores its length as a u32 at both
//! ends; trailer padding beyond the implicit `(8 - size % 8) % 8` bytes
//! stores its length as a u32 at its head. This makes header, body and
//! trailer locatable from each other in O(1).

pub mod checksum;
pub mod lookup;

use crate::error::Error;
use crate::platform;
use crate::shadow::{CompactBlockInfo, Shadow, ShadowMarker};
use crate::stack::{StackId, StackProvider};
use crate::util::{
    align_up, is_aligned, HEADER_PADDING_BYTE, MAX_ALIGN, MAX_BODY_SIZE, MIN_ALIGN,
    SHADOW_RATIO, TRAILER_PADDING_BYTE,
};
use core::mem::size_of;
use core::ptr;

pub use checksum::{calculate_checksum, is_block_corrupt, set_checksum, validate, BlockCorruption};
pub use lookup::{find_containing_block, find_containing_freed_block};

pub const BLOCK_HEADER_MAGIC: u16 = 0xCA80;
pub const BLOCK_TRAILER_MAGIC: u16 = 0x5A1C;

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub const TRAILER_SIZE: usize = size_of::<BlockTrailer>();

const CHECKSUM_BITS: u16 = 13;
const CHECKSUM_MASK: u16 = (1 << CHECKSUM_BITS) - 1;
const NESTED_BIT: u16 = 1 << 13;
const HEADER_PADDING_BIT: u16 = 1 << 14;
const EXCESS_TRAILER_PADDING_BIT: u16 = 1 << 15;
const STATE_MASK: u32 = 0b11;
const SIZE_SHIFT: u32 = 2;

/// Lifecycle state stored in the header. Zero is deliberately not a state so
/// that zeroed memory never parses as a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    Allocated = 1,
    Quarantined = 2,
    Freed = 3,
}

impl BlockState {
    pub const fn from_raw(raw: u8) -> Option<BlockState> {
        match raw {
            1 => Some(BlockState::Allocated),
            2 => Some(BlockState::Quarantined),
            3 => Some(BlockState::Freed),
            _ => None,
        }
    }

    /// Quarantined or freed.
    #[inline]
    pub const fn is_freed(self) -> bool {
        !matches!(self, BlockState::Allocated)
    }
}

/// Block header, 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u16,
    /// checksum:13 | is_nested:1 | has_header_padding:1 | has_excess_trailer_padding:1
    flags: u16,
    /// state:2 | body_size:30
    state_size: u32,
    alloc_stack: u32,
    free_stack: u32,
}

impl BlockHeader {
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.flags & CHECKSUM_MASK
    }

    #[inline]
    pub fn set_checksum(&mut self, checksum: u16) {
        self.flags = (self.flags & !CHECKSUM_MASK) | (checksum & CHECKSUM_MASK);
    }

    #[inline]
    pub fn is_nested(&self) -> bool {
        self.flags & NESTED_BIT != 0
    }

    #[inline]
    pub fn has_header_padding(&self) -> bool {
        self.flags & HEADER_PADDING_BIT != 0
    }

    #[inline]
    pub fn has_excess_trailer_padding(&self) -> bool {
        self.flags & EXCESS_TRAILER_PADDING_BIT != 0
    }

    #[inline]
    pub fn raw_state(&self) -> u8 {
        (self.state_size & STATE_MASK) as u8
    }

    #[inline]
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.raw_state())
    }

    #[inline]
    pub fn set_state(&mut self, state: BlockState) {
        self.state_size = (self.state_size & !STATE_MASK) | state as u32;
    }

    #[inline]
    pub fn body_size(&self) -> usize {
        (self.state_size >> SIZE_SHIFT) as usize
    }

    #[inline]
    pub fn alloc_stack(&self) -> Option<StackId> {
        StackId::from_raw(self.alloc_stack)
    }

    #[inline]
    pub fn set_alloc_stack(&mut self, id: Option<StackId>) {
        self.alloc_stack = StackId::to_raw(id);
    }

    #[inline]
    pub fn free_stack(&self) -> Option<StackId> {
        StackId::from_raw(self.free_stack)
    }

    #[inline]
    pub fn set_free_stack(&mut self, id: Option<StackId>) {
        self.free_stack = StackId::to_raw(id);
    }

    pub(crate) fn raw_free_stack(&self) -> u32 {
        self.free_stack
    }
}

/// Block trailer, 24 bytes, ending the block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockTrailer {
    pub alloc_tid: u32,
    pub free_tid: u32,
    pub alloc_ticks: u32,
    pub free_ticks: u32,
    pub heap_id: u32,
    pub magic: u16,
    pub alignment_log: u8,
    reserved: u8,
}

/// Sizes of every part of a block for a given request. Header padding is the
/// worst case; the actual split depends on where the block lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    pub alignment: usize,
    pub block_size: usize,
    /// Bytes before the body before alignment.
    pub left_redzone_size: usize,
    /// Bytes reserved for reaching `alignment` from an 8-aligned start.
    pub alignment_slack: usize,
    pub body_size: usize,
    /// Minimum right redzone, trailer included.
    pub right_redzone_size: usize,
}

impl BlockLayout {
    /// Plan a block for `body_size` bytes aligned to `alignment`, with at least
    /// `min_left_redzone` bytes before and `min_right_redzone` bytes after the
    /// body. Returns `None` if the request cannot be encoded.
    pub fn plan(
        body_size: usize,
        alignment: usize,
        min_left_redzone: usize,
        min_right_redzone: usize,
    ) -> Option<BlockLayout> {
        let alignment = alignment.max(MIN_ALIGN);
        if !alignment.is_power_of_two() || alignment > MAX_ALIGN || body_size > MAX_BODY_SIZE {
            return None;
        }
        let left = align_up(min_left_redzone.max(HEADER_SIZE), SHADOW_RATIO);
        let right = min_right_redzone.max(TRAILER_SIZE);
        let slack = alignment - MIN_ALIGN;
        let block_size = left
            .checked_add(slack)?
            .checked_add(body_size)?
            .checked_add(right)?
            .checked_add(SHADOW_RATIO - 1)?
            & !(SHADOW_RATIO - 1);
        Some(BlockLayout {
            alignment,
            block_size,
            left_redzone_size: left,
            alignment_slack: slack,
            body_size,
            right_redzone_size: block_size - left - slack - body_size,
        })
    }
}

/// Addresses and sizes of a placed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub block: usize,
    pub block_size: usize,
    pub header_padding_size: usize,
    pub body: usize,
    pub body_size: usize,
    pub trailer_padding_size: usize,
    pub is_nested: bool,
}

impl BlockInfo {
    #[inline]
    pub fn header_ptr(&self) -> *mut BlockHeader {
        self.block as *mut BlockHeader
    }

    #[inline]
    pub fn trailer_addr(&self) -> usize {
        self.block + self.block_size - TRAILER_SIZE
    }

    #[inline]
    pub fn trailer_ptr(&self) -> *mut BlockTrailer {
        self.trailer_addr() as *mut BlockTrailer
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.block + self.block_size
    }

    #[inline]
    pub fn body_end(&self) -> usize {
        self.body + self.body_size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.block && addr < self.end()
    }

    /// Copy of the header.
    ///
    /// # Safety
    /// The block's memory must be mapped.
    #[inline]
    pub unsafe fn header(&self) -> BlockHeader {
        ptr::read(self.header_ptr())
    }

    /// Copy of the trailer.
    ///
    /// # Safety
    /// The block's memory must be mapped.
    #[inline]
    pub unsafe fn trailer(&self) -> BlockTrailer {
        ptr::read(self.trailer_ptr())
    }

    /// Geometry as it should appear in the shadow.
    pub fn compact(&self) -> CompactBlockInfo {
        CompactBlockInfo {
            block: self.block,
            block_size: self.block_size,
            header_size: self.body - self.block,
            trailer_size: self.end() - self.body_end(),
            is_nested: self.is_nested,
        }
    }

    /// Rebuild from shadow-derived geometry.
    pub fn from_compact(c: &CompactBlockInfo) -> Option<BlockInfo> {
        if c.header_size < HEADER_SIZE || c.trailer_size < TRAILER_SIZE {
            return None;
        }
        Some(BlockInfo {
            block: c.block,
            block_size: c.block_size,
            header_padding_size: c.header_size - HEADER_SIZE,
            body: c.body(),
            body_size: c.body_size(),
            trailer_padding_size: c.trailer_size - TRAILER_SIZE,
            is_nested: c.is_nested,
        })
    }

    /// Value copy of the metadata, for reports.
    ///
    /// # Safety
    /// The block's memory must be mapped.
    pub unsafe fn snapshot(&self) -> BlockSnapshot {
        let header = self.header();
        let trailer = self.trailer();
        BlockSnapshot {
            block: self.block,
            block_size: self.block_size,
            body: self.body,
            body_size: self.body_size,
            is_nested: self.is_nested,
            state: header.state(),
            alignment: 1usize.checked_shl(trailer.alignment_log as u32).unwrap_or(0),
            alloc_stack: header.alloc_stack(),
            free_stack: header.free_stack(),
            alloc_tid: trailer.alloc_tid,
            free_tid: trailer.free_tid,
            alloc_ticks: trailer.alloc_ticks,
            free_ticks: trailer.free_ticks,
            heap_id: trailer.heap_id,
            corrupt: is_block_corrupt(self),
        }
    }
}

/// Metadata of a block at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSnapshot {
    pub block: usize,
    pub block_size: usize,
    pub body: usize,
    pub body_size: usize,
    pub is_nested: bool,
    /// `None` when the header holds an invalid state.
    pub state: Option<BlockState>,
    pub alignment: usize,
    pub alloc_stack: Option<StackId>,
    pub free_stack: Option<StackId>,
    pub alloc_tid: u32,
    pub free_tid: u32,
    pub alloc_ticks: u32,
    pub free_ticks: u32,
    pub heap_id: u32,
    pub corrupt: bool,
}

/// Write a fresh block into `raw`. Shadow is left untouched.
///
/// # Safety
/// `raw` must be 8-aligned and point to `layout.block_size` writable bytes.
pub unsafe fn initialize(raw: *mut u8, layout: &BlockLayout, is_nested: bool) -> BlockInfo {
    let block = raw as usize;
    debug_assert!(is_aligned(block, MIN_ALIGN));

    let body = align_up(block + layout.left_redzone_size, layout.alignment);
    let header_padding_size = body - block - HEADER_SIZE;
    debug_assert!(body + layout.body_size + TRAILER_SIZE <= block + layout.block_size);
    let trailer = block + layout.block_size - TRAILER_SIZE;
    let trailer_padding_size = trailer - body - layout.body_size;
    let implicit_padding = (SHADOW_RATIO - layout.body_size % SHADOW_RATIO) % SHADOW_RATIO;

    let mut flags = 0u16;
    if is_nested {
        flags |= NESTED_BIT;
    }
    if header_padding_size > 0 {
        flags |= HEADER_PADDING_BIT;
    }
    if trailer_padding_size > implicit_padding {
        flags |= EXCESS_TRAILER_PADDING_BIT;
    }
    ptr::write(
        raw as *mut BlockHeader,
        BlockHeader {
            magic: BLOCK_HEADER_MAGIC,
            flags,
            state_size: ((layout.body_size as u32) << SIZE_SHIFT) | BlockState::Allocated as u32,
            alloc_stack: 0,
            free_stack: 0,
        },
    );

    if header_padding_size > 0 {
        let pad = (block + HEADER_SIZE) as *mut u8;
        ptr::write_bytes(pad, HEADER_PADDING_BYTE, header_padding_size);
        // Padding is a multiple of 8, so both length words fit.
        ptr::write_unaligned(pad as *mut u32, header_padding_size as u32);
        ptr::write_unaligned((body - 4) as *mut u32, header_padding_size as u32);
    }

    let tpad = (body + layout.body_size) as *mut u8;
    ptr::write_bytes(tpad, TRAILER_PADDING_BYTE, trailer_padding_size);
    if trailer_padding_size > implicit_padding {
        ptr::write_unaligned(tpad as *mut u32, trailer_padding_size as u32);
    }

    ptr::write(
        trailer as *mut BlockTrailer,
        BlockTrailer {
            alloc_tid: 0,
            free_tid: 0,
            alloc_ticks: 0,
            free_ticks: 0,
            heap_id: 0,
            magic: BLOCK_TRAILER_MAGIC,
            alignment_log: layout.alignment.trailing_zeros() as u8,
            reserved: 0,
        },
    );

    BlockInfo {
        block,
        block_size: layout.block_size,
        header_padding_size,
        body,
        body_size: layout.body_size,
        trailer_padding_size,
        is_nested,
    }
}

/// Poison an allocated block: redzones poisoned, body addressable, start and
/// end granules carrying the block markers.
pub fn poison_allocated(shadow: &Shadow, info: &BlockInfo) {
    shadow.poison(info.block, info.body - info.block, ShadowMarker::LEFT_REDZONE);
    shadow.poison(
        info.block,
        SHADOW_RATIO,
        ShadowMarker::block_start(info.is_nested, info.body_size),
    );
    shadow.unpoison(info.body, info.body_size);
    let right = align_up(info.body_end(), SHADOW_RATIO);
    shadow.poison(right, info.end() - right, ShadowMarker::RIGHT_REDZONE);
    shadow.poison(
        info.end() - SHADOW_RATIO,
        SHADOW_RATIO,
        ShadowMarker::block_end(info.is_nested),
    );
}

/// Lay out, stamp and poison a new allocated block.
///
/// # Safety
/// Same contract as [`initialize`]; `raw` must lie inside `shadow`'s window.
pub unsafe fn create_block(
    shadow: &Shadow,
    raw: *mut u8,
    layout: &BlockLayout,
    is_nested: bool,
    alloc_stack: Option<StackId>,
    heap_id: u32,
) -> BlockInfo {
    let info = initialize(raw, layout, is_nested);
    (*info.header_ptr()).set_alloc_stack(alloc_stack);
    let trailer = &mut *info.trailer_ptr();
    trailer.alloc_tid = platform::thread_id();
    trailer.alloc_ticks = platform::ticks();
    trailer.heap_id = heap_id;
    set_checksum(&info);
    poison_allocated(shadow, &info);
    info
}

/// Move an allocated block to the quarantined state: record the free site,
/// mark the body freed in the shadow and refresh the checksum. Body bytes are
/// not touched.
///
/// # Safety
/// `info` must describe a live block owned by the caller.
pub unsafe fn mark_quarantined(shadow: &Shadow, info: &BlockInfo, free_stack: Option<StackId>) {
    let header = &mut *info.header_ptr();
    header.set_state(BlockState::Quarantined);
    header.set_free_stack(free_stack);
    let trailer = &mut *info.trailer_ptr();
    trailer.free_tid = platform::thread_id();
    trailer.free_ticks = platform::ticks();
    shadow.mark_as_freed(info.body, info.body_size);
    set_checksum(info);
}

/// Final state before the memory goes back to its heap.
///
/// # Safety
/// `info` must describe a block owned by the caller.
pub unsafe fn mark_freed(info: &BlockInfo) {
    (*info.header_ptr()).set_state(BlockState::Freed);
    set_checksum(info);
}

/// Read the block whose header is at `header`, using only its own metadata.
///
/// # Safety
/// At least a header's worth of memory at `header` must be mapped; the rest
/// is only read if the header magic matches.
pub unsafe fn block_info_from_header(header: usize) -> Option<BlockInfo> {
    parse_header(header, usize::MAX)
}

/// Parse a header, refusing to read at or beyond `limit`.
pub(crate) unsafe fn parse_header(header: usize, limit: usize) -> Option<BlockInfo> {
    if !is_aligned(header, MIN_ALIGN) || header.checked_add(HEADER_SIZE + 4)? > limit {
        return None;
    }
    let h = ptr::read(header as *const BlockHeader);
    if h.magic != BLOCK_HEADER_MAGIC {
        return None;
    }
    let header_padding_size = if h.has_header_padding() {
        let len = ptr::read_unaligned((header + HEADER_SIZE) as *const u32) as usize;
        if len == 0 || len > MAX_ALIGN || !is_aligned(len, SHADOW_RATIO) {
            return None;
        }
        len
    } else {
        0
    };
    let body = header + HEADER_SIZE + header_padding_size;
    let body_size = h.body_size();
    let implicit = (SHADOW_RATIO - body_size % SHADOW_RATIO) % SHADOW_RATIO;
    if body.checked_add(body_size)?.checked_add(TRAILER_SIZE)? > limit {
        return None;
    }
    let trailer_padding_size = if h.has_excess_trailer_padding() {
        let len = ptr::read_unaligned((body + body_size) as *const u32) as usize;
        if len <= implicit || !is_aligned(body + body_size + len, SHADOW_RATIO) {
            return None;
        }
        len
    } else {
        implicit
    };
    let end = body + body_size + trailer_padding_size + TRAILER_SIZE;
    if end > limit {
        return None;
    }
    Some(BlockInfo {
        block: header,
        block_size: end - header,
        header_padding_size,
        body,
        body_size,
        trailer_padding_size,
        is_nested: h.is_nested(),
    })
}

/// Locate the block whose body starts at `body`.
///
/// Header metadata is tried first; the length word preceding a padded body
/// and the block start marker in the shadow must both agree. When the header
/// is too damaged to parse, the shadow geometry alone is used.
pub fn user_pointer_to_block_info(shadow: &Shadow, body: usize) -> Option<BlockInfo> {
    if !is_aligned(body, MIN_ALIGN) || !shadow.contains(body) {
        return None;
    }
    let lower = shadow.heap_bounds().start;
    let starts_block = |addr: usize| {
        addr >= lower
            && shadow
                .get_marker(addr)
                .is_some_and(|m| m.is_block_start())
    };

    let mut candidates = [body.checked_sub(HEADER_SIZE), None];
    if body >= lower + 4 {
        let len = unsafe { ptr::read_unaligned((body - 4) as *const u32) } as usize;
        if len != 0 && len <= MAX_ALIGN && is_aligned(len, SHADOW_RATIO) {
            candidates[1] = body.checked_sub(HEADER_SIZE + len);
        }
    }
    for header in candidates.into_iter().flatten() {
        if !starts_block(header) {
            continue;
        }
        if let Some(info) = unsafe { parse_header(header, shadow.end()) } {
            if info.body == body {
                return Some(info);
            }
        }
    }

    // The last granule before the body belongs to the block itself even when
    // the body begins with a nested block.
    let compact = shadow.block_info_from_shadow(body.checked_sub(1)?)?;
    if compact.body() != body {
        return None;
    }
    BlockInfo::from_compact(&compact)
}

/// O(1) user pointer → header address.
pub fn user_pointer_to_block_header(shadow: &Shadow, body: usize) -> Option<*mut BlockHeader> {
    user_pointer_to_block_info(shadow, body).map(|info| info.header_ptr())
}

/// O(1) header → user pointer.
///
/// # Safety
/// `header` must point to a readable block header.
pub unsafe fn block_header_to_user_pointer(header: *const BlockHeader) -> Option<*mut u8> {
    block_info_from_header(header as usize).map(|info| info.body as *mut u8)
}

/// O(1) header → trailer.
///
/// # Safety
/// `header` must point to a readable block header.
pub unsafe fn block_header_to_block_trailer(
    header: *const BlockHeader,
) -> Option<*mut BlockTrailer> {
    block_info_from_header(header as usize).map(|info| info.trailer_ptr())
}

/// Duplicate a block at `dst`: bytes, metadata and shadow markers. Both stack
/// records gain a reference.
///
/// # Safety
/// `src` must describe a live block; `dst` must point to `src.block_size`
/// writable bytes inside the window, not overlapping `src`.
pub unsafe fn clone_block(
    shadow: &Shadow,
    src: &BlockInfo,
    dst: *mut u8,
    stacks: &dyn StackProvider,
) -> Result<BlockInfo, Error> {
    let dst_addr = dst as usize;
    let alignment = 1usize << (*src.trailer_ptr()).alignment_log;
    if dst_addr % alignment != src.block % alignment {
        return Err(Error::InvalidAlignment(alignment));
    }
    ptr::copy_nonoverlapping(src.block as *const u8, dst, src.block_size);
    let header = src.header();
    if let Some(id) = header.alloc_stack() {
        stacks.add_ref(id);
    }
    if let Some(id) = header.free_stack() {
        stacks.add_ref(id);
    }
    shadow.clone_range(src.block, dst_addr, src.block_size);
    Ok(BlockInfo {
        block: dst_addr,
        body: dst_addr + (src.body - src.block),
        ..*src
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::shadow::tests::test_shadow;
    use crate::stack::StackCache;
    use crate::util::hash_bytes;

    /// Carve a block from the heap area at `offset`.
    pub(crate) unsafe fn block_at(
        shadow: &Shadow,
        offset: usize,
        size: usize,
        align: usize,
        nested: bool,
    ) -> BlockInfo {
        let layout = BlockLayout::plan(size, align, 0, 0).unwrap();
        let raw = (shadow.heap_bounds().start + offset) as *mut u8;
        create_block(shadow, raw, &layout, nested, None, 1)
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(TRAILER_SIZE, 24);
        let l = BlockLayout::plan(13, 8, 0, 0).unwrap();
        assert_eq!(l.block_size, 56);
        let l = BlockLayout::plan(100, 64, 0, 32).unwrap();
        assert_eq!(l.block_size % 8, 0);
        assert!(l.block_size >= 16 + 56 + 100 + 32);
        assert!(BlockLayout::plan(1 << 30, 8, 0, 0).is_none());
        assert!(BlockLayout::plan(8, 24, 0, 0).is_none());
    }

    #[test]
    fn body_is_aligned_and_accessible() {
        let s = test_shadow();
        for (offset, align) in [(0, 8), (8, 16), (24, 64), (40, 256), (1000, 4096)] {
            let info = unsafe { block_at(&s, offset * 8, 100, align, false) };
            assert_eq!(info.body % align, 0);
            for i in 0..100 {
                assert!(s.is_accessible(info.body + i));
            }
            assert!(!s.is_accessible(info.body - 1));
            assert!(!s.is_accessible(info.body + 100));
            assert!(!s.is_accessible(info.block));
            assert!(!s.is_accessible(info.end() - 1));
            assert_eq!(s.block_info_from_shadow(info.body), Some(info.compact()));
            s.unpoison(info.block, info.block_size);
        }
    }

    #[test]
    fn header_body_trailer_round_trip() {
        let s = test_shadow();
        let layout = BlockLayout::plan(37, 128, 0, 64).unwrap();
        let raw = (s.heap_bounds().start + 8) as *mut u8;
        let info = unsafe { create_block(&s, raw, &layout, false, None, 7) };
        let header = info.header_ptr();
        unsafe {
            assert!((*header).has_header_padding());
            assert!((*header).has_excess_trailer_padding());
            assert_eq!(block_header_to_user_pointer(header), Some(info.body as *mut u8));
            assert_eq!(block_header_to_block_trailer(header), Some(info.trailer_ptr()));
            assert_eq!(info.trailer().heap_id, 7);
            assert_eq!(info.trailer().alignment_log, 7);
            assert_eq!(block_info_from_header(info.block), Some(info));
        }
        assert_eq!(user_pointer_to_block_header(&s, info.body), Some(header));
        assert_eq!(user_pointer_to_block_info(&s, info.body + 8), None);
        assert!(!unsafe { is_block_corrupt(&info) });
    }

    #[test]
    fn quarantine_poisons_span_and_keeps_body() {
        let s = test_shadow();
        let stacks = StackCache::new(8, 0);
        let info = unsafe { block_at(&s, 0, 100, 8, false) };
        unsafe { ptr::write_bytes(info.body as *mut u8, 0xAB, 100) };
        let body = || unsafe { core::slice::from_raw_parts(info.body as *const u8, 100) };
        let before = hash_bytes(0, body());

        unsafe { mark_quarantined(&s, &info, Some(stacks.capture())) };
        assert_eq!(hash_bytes(0, body()), before);
        for addr in info.block..info.end() {
            assert!(!s.is_accessible(addr));
        }
        unsafe {
            assert_eq!(info.header().state(), Some(BlockState::Quarantined));
            assert!(info.header().free_stack().is_some());
            assert!(!is_block_corrupt(&info));
        }
        assert_eq!(s.block_info_from_shadow(info.body + 50), Some(info.compact()));
    }

    #[test]
    fn clone_shares_stack_records() {
        let s = test_shadow();
        let stacks = StackCache::new(8, 0);
        let layout = BlockLayout::plan(40, 8, 0, 0).unwrap();
        let raw = s.heap_bounds().start as *mut u8;
        let id = stacks.capture();
        let src = unsafe { create_block(&s, raw, &layout, false, Some(id), 1) };
        unsafe { ptr::write_bytes(src.body as *mut u8, 0x5A, 40) };

        let dst = unsafe {
            clone_block(&s, &src, raw.add(4096), &stacks).unwrap()
        };
        assert_eq!(stacks.ref_count(id), 2);
        let a = unsafe { core::slice::from_raw_parts(src.block as *const u8, src.block_size) };
        let b = unsafe { core::slice::from_raw_parts(dst.block as *const u8, dst.block_size) };
        assert_eq!(a, b);
        assert_eq!(s.block_info_from_shadow(dst.body), Some(dst.compact()));
        assert!(!unsafe { is_block_corrupt(&dst) });
    }
}
