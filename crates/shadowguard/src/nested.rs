//! Blocks placed by the caller inside memory it already owns.
//!
//! A caller that sub-allocates from one big allocation can still get
//! redzones and use-after-free detection for its objects: it asks for the
//! padded size, hands the raw memory back to be laid out as a nested block,
//! and later quarantines or destroys the object itself.

use crate::block::{
    clone_block, create_block, mark_freed, mark_quarantined, parse_header, BlockInfo,
    BlockLayout, BlockState,
};
use crate::error::Error;
use crate::shadow::{Shadow, ShadowMarker};
use crate::stack::StackProvider;
use crate::util::{align_down, align_up, is_aligned, MIN_ALIGN, SHADOW_RATIO};
use core::ptr::NonNull;

/// Heap id recorded in the trailer of caller-managed objects.
pub const NESTED_HEAP_ID: u32 = 0;

/// Bytes of raw memory an object of `user_size` bytes aligned to `alignment`
/// occupies once wrapped in a block.
pub fn object_size(user_size: usize, alignment: usize) -> Result<usize, Error> {
    plan(user_size, alignment).map(|layout| layout.block_size)
}

fn plan(user_size: usize, alignment: usize) -> Result<BlockLayout, Error> {
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidAlignment(alignment));
    }
    BlockLayout::plan(user_size, alignment, 0, 0).ok_or(Error::SizeTooLarge(user_size))
}

fn object_at(shadow: &Shadow, raw: *mut u8) -> Result<BlockInfo, Error> {
    let addr = raw as usize;
    let starts_block = shadow.get_marker(addr).is_some_and(|m| m.is_block_start());
    // SAFETY: the shadow says a block starts here; parsing stops at the window end.
    starts_block
        .then(|| unsafe { parse_header(addr, shadow.end()) })
        .flatten()
        .ok_or(Error::InvalidPointer(addr))
}

/// Lay out a nested block in `raw` and return the user pointer.
///
/// # Safety
/// `raw` must point to `object_size(user_size, alignment)` writable bytes
/// inside the window that the caller owns.
pub unsafe fn initialize_object(
    shadow: &Shadow,
    stacks: &dyn StackProvider,
    raw: *mut u8,
    user_size: usize,
    alignment: usize,
) -> Result<NonNull<u8>, Error> {
    let addr = raw as usize;
    if !is_aligned(addr, MIN_ALIGN) {
        return Err(Error::InvalidAlignment(MIN_ALIGN));
    }
    let layout = plan(user_size, alignment)?;
    if !shadow.contains(addr) || !shadow.contains(addr + layout.block_size - 1) {
        return Err(Error::InvalidPointer(addr));
    }
    let info = create_block(
        shadow,
        raw,
        &layout,
        true,
        Some(stacks.capture()),
        NESTED_HEAP_ID,
    );
    NonNull::new(info.body as *mut u8).ok_or(Error::InvalidPointer(addr))
}

/// Quarantine the object whose block starts at `raw`. The memory stays
/// poisoned until [`destroy_object`].
///
/// # Safety
/// `raw` must be a pointer previously passed to [`initialize_object`].
pub unsafe fn quarantine_object(
    shadow: &Shadow,
    stacks: &dyn StackProvider,
    raw: *mut u8,
) -> Result<(), Error> {
    let info = object_at(shadow, raw)?;
    if info.header().state() != Some(BlockState::Allocated) {
        log::warn!("object at {:#x} is already quarantined", info.block);
        return Err(Error::DoubleFree(info.body));
    }
    mark_quarantined(shadow, &info, Some(stacks.capture()));
    Ok(())
}

/// Tear down the object whose block starts at `raw` and make its memory
/// addressable again.
///
/// # Safety
/// `raw` must be a pointer previously passed to [`initialize_object`], and
/// nothing may use the object afterwards.
pub unsafe fn destroy_object(
    shadow: &Shadow,
    stacks: &dyn StackProvider,
    raw: *mut u8,
) -> Result<(), Error> {
    let info = object_at(shadow, raw)?;
    mark_freed(&info);
    let header = info.header();
    for id in [header.alloc_stack(), header.free_stack()].into_iter().flatten() {
        stacks.release(id);
    }
    shadow.unpoison(info.block, info.block_size);
    Ok(())
}

/// Copy the object at `src` to `dst`, which must have the same alignment
/// modulo the object's body alignment. Returns the new user pointer.
///
/// # Safety
/// `src` must be a live object and `dst` must point to enough writable
/// bytes inside the window, not overlapping `src`.
pub unsafe fn clone_object(
    shadow: &Shadow,
    stacks: &dyn StackProvider,
    src: *mut u8,
    dst: *mut u8,
) -> Result<NonNull<u8>, Error> {
    let info = object_at(shadow, src)?;
    let dst_addr = dst as usize;
    if !shadow.contains(dst_addr) || !shadow.contains(dst_addr + info.block_size - 1) {
        return Err(Error::InvalidPointer(dst_addr));
    }
    let copy = clone_block(shadow, &info, dst, stacks)?;
    NonNull::new(copy.body as *mut u8).ok_or(Error::InvalidPointer(dst_addr))
}

/// Mark `[addr, addr + size)` as a user redzone. Bytes sharing the first
/// granule but lying before `addr` stay addressable.
pub fn poison_memory_range(shadow: &Shadow, addr: usize, size: usize) {
    let end = addr.saturating_add(size);
    let first = align_up(addr, SHADOW_RATIO);
    if first != addr {
        let granule = align_down(addr, SHADOW_RATIO);
        let keep = (addr - granule) as u8;
        if shadow
            .get_marker(granule)
            .is_some_and(|m| m.addressable_bytes() > keep as usize)
        {
            shadow.poison(granule, SHADOW_RATIO, ShadowMarker::partial(keep));
        }
    }
    let last = align_up(end, SHADOW_RATIO);
    if last > first {
        shadow.poison(first, last - first, ShadowMarker::USER_REDZONE);
    }
}

/// Make `[addr, addr + size)` addressable.
pub fn unpoison_memory_range(shadow: &Shadow, addr: usize, size: usize) {
    let granule = align_down(addr, SHADOW_RATIO);
    shadow.unpoison(granule, size + (addr - granule));
}
