//! Byte-granular accessibility map for the managed address window.
//!
//! The window is one anonymous mapping. Its first `size / 8` bytes hold the
//! shadow itself (one marker per 8-byte granule of the whole window, its own
//! bytes included), followed by a 64 KiB invalid-address band. The rest is
//! heap area handed to backing heaps.
//!
//! Markers are `AtomicU8` accessed with relaxed ordering. Mutations of a span
//! are only done by the thread that owns the underlying allocation; readers
//! such as the heap checker may observe an in-flight update of some other
//! block, which they tolerate.

pub mod marker;
pub mod walker;

use crate::error::Error;
use crate::platform;
use crate::util::{
    align_down, align_up, is_aligned, ADDRESS_LOWER_BOUND, MAX_BLOCK_SIZE, MAX_WINDOW_SIZE,
    SHADOW_RATIO, SHADOW_RATIO_LOG,
};
use core::fmt::Write as _;
use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

pub use marker::{MarkerKind, ShadowMarker};
pub use walker::ShadowWalker;

/// Block geometry recovered from shadow markers alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactBlockInfo {
    /// Address of the first byte of the block (its header).
    pub block: usize,
    pub block_size: usize,
    /// Header plus header padding.
    pub header_size: usize,
    /// Trailer padding plus trailer.
    pub trailer_size: usize,
    pub is_nested: bool,
}

impl CompactBlockInfo {
    #[inline]
    pub fn body(&self) -> usize {
        self.block + self.header_size
    }

    #[inline]
    pub fn body_size(&self) -> usize {
        self.block_size - self.header_size - self.trailer_size
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.block + self.block_size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.block && addr < self.end()
    }
}

/// The shadow table and the window it describes.
pub struct Shadow {
    base: usize,
    size: usize,
    heap_lower: usize,
}

unsafe impl Send for Shadow {}
unsafe impl Sync for Shadow {}

impl Shadow {
    /// Map a window of `size` bytes and initialize its shadow.
    pub fn setup(size: usize) -> Result<Shadow, Error> {
        let page = platform::page_size();
        let shadow_bytes = align_up(size >> SHADOW_RATIO_LOG, page);
        if size > MAX_WINDOW_SIZE
            || !is_aligned(size, page)
            || size <= shadow_bytes + ADDRESS_LOWER_BOUND
        {
            return Err(Error::InvalidWindow(size));
        }

        let base = platform::map_window(size).ok_or(Error::MapFailed(size))?;
        let base = base.as_ptr() as usize;
        let shadow = Shadow {
            base,
            size,
            heap_lower: base + shadow_bytes + ADDRESS_LOWER_BOUND,
        };
        shadow.poison(shadow.base, shadow_bytes, ShadowMarker::ASAN_INTERNAL);
        shadow.poison(
            shadow.base + shadow_bytes,
            ADDRESS_LOWER_BOUND,
            ShadowMarker::INVALID_ADDRESS,
        );
        log::debug!(
            "shadow window {:#x}..{:#x}, heap area starts at {:#x}",
            shadow.base,
            shadow.end(),
            shadow.heap_lower
        );
        Ok(shadow)
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// The part of the window available to backing heaps.
    pub fn heap_bounds(&self) -> Range<usize> {
        self.heap_lower..self.end()
    }

    #[inline]
    fn index(&self, addr: usize) -> Option<usize> {
        if self.contains(addr) {
            Some((addr - self.base) >> SHADOW_RATIO_LOG)
        } else {
            None
        }
    }

    #[inline]
    fn granule_count(&self) -> usize {
        self.size >> SHADOW_RATIO_LOG
    }

    #[inline]
    fn granule_addr(&self, index: usize) -> usize {
        self.base + (index << SHADOW_RATIO_LOG)
    }

    #[inline]
    fn cell(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.granule_count());
        // The first granule_count() bytes of the window are the shadow.
        unsafe { &*(self.base as *const AtomicU8).add(index) }
    }

    #[inline]
    fn load(&self, index: usize) -> ShadowMarker {
        ShadowMarker(self.cell(index).load(Ordering::Relaxed))
    }

    #[inline]
    fn store(&self, index: usize, marker: ShadowMarker) {
        self.cell(index).store(marker.0, Ordering::Relaxed);
    }

    /// Clamp `[addr, addr + size)` to the window, as granule indices.
    fn granules(&self, addr: usize, size: usize) -> Range<usize> {
        let start = addr.max(self.base).min(self.end());
        let end = addr.saturating_add(size).max(self.base).min(self.end());
        ((start - self.base) >> SHADOW_RATIO_LOG)..((end - self.base) >> SHADOW_RATIO_LOG)
    }

    /// Mark every granule of `[addr, addr + size)` with `marker`.
    /// Both `addr` and `size` must be granule-aligned.
    pub fn poison(&self, addr: usize, size: usize, marker: ShadowMarker) {
        debug_assert!(is_aligned(addr, SHADOW_RATIO));
        debug_assert!(is_aligned(size, SHADOW_RATIO));
        for i in self.granules(addr, size) {
            self.store(i, marker);
        }
    }

    /// Make `[addr, addr + size)` addressable. `addr` must be granule-aligned;
    /// a trailing partial granule gets a partial marker.
    pub fn unpoison(&self, addr: usize, size: usize) {
        debug_assert!(is_aligned(addr, SHADOW_RATIO));
        let full = align_down(size, SHADOW_RATIO);
        for i in self.granules(addr, full) {
            self.store(i, ShadowMarker::ADDRESSABLE);
        }
        let rem = size - full;
        if rem != 0 {
            if let Some(i) = self.index(addr + full) {
                self.store(i, ShadowMarker::partial(rem as u8));
            }
        }
    }

    /// Turn the addressable granules of a range into freed markers, leaving
    /// the markers of any nested block untouched.
    pub fn mark_as_freed(&self, addr: usize, size: usize) {
        debug_assert!(is_aligned(addr, SHADOW_RATIO));
        for i in self.granules(addr, align_up(size, SHADOW_RATIO)) {
            if self.load(i).is_addressable() {
                self.store(i, ShadowMarker::FREED);
            }
        }
    }

    /// Convert the active block markers of a range into their historic form.
    pub fn mark_as_historic(&self, addr: usize, size: usize) {
        for i in self.granules(addr, size) {
            self.store(i, self.load(i).to_historic());
        }
    }

    /// Raw marker of the granule covering `addr`, or `None` outside the window.
    #[inline]
    pub fn get_marker(&self, addr: usize) -> Option<ShadowMarker> {
        self.index(addr).map(|i| self.load(i))
    }

    /// Whether the byte at `addr` may be touched by user code.
    #[inline]
    pub fn is_accessible(&self, addr: usize) -> bool {
        match self.get_marker(addr) {
            Some(m) => (addr & (SHADOW_RATIO - 1)) < m.addressable_bytes(),
            None => false,
        }
    }

    /// Whether the whole range is accessible.
    pub fn is_range_accessible(&self, addr: usize, size: usize) -> bool {
        self.find_first_poisoned_byte(addr, size).is_none()
    }

    /// Address of the first inaccessible byte in a range.
    pub fn find_first_poisoned_byte(&self, addr: usize, size: usize) -> Option<usize> {
        let end = addr.checked_add(size)?;
        let mut cursor = addr;
        while cursor < end {
            let Some(m) = self.get_marker(cursor) else {
                return Some(cursor);
            };
            let granule = align_down(cursor, SHADOW_RATIO);
            let ok_end = granule + m.addressable_bytes();
            if cursor >= ok_end {
                return Some(cursor);
            }
            if ok_end < end && ok_end < granule + SHADOW_RATIO {
                return Some(ok_end);
            }
            cursor = granule + SHADOW_RATIO;
        }
        None
    }

    /// Copy markers verbatim from one granule-aligned range to another.
    pub fn clone_range(&self, src: usize, dst: usize, size: usize) {
        debug_assert!(is_aligned(src, SHADOW_RATIO));
        debug_assert!(is_aligned(dst, SHADOW_RATIO));
        let src_range = self.granules(src, size);
        let dst_range = self.granules(dst, size);
        let len = src_range.len().min(dst_range.len());
        let (s, d) = (src_range.start, dst_range.start);
        if d <= s {
            for k in 0..len {
                self.store(d + k, self.load(s + k));
            }
        } else {
            for k in (0..len).rev() {
                self.store(d + k, self.load(s + k));
            }
        }
    }

    // ------------------------------------------------------------------
    // Block scanning
    // ------------------------------------------------------------------

    #[inline]
    fn scan_limit() -> usize {
        MAX_BLOCK_SIZE >> SHADOW_RATIO_LOG
    }

    /// Walk left from `index` (inclusive) for a block start that balances the
    /// block ends seen on the way.
    fn scan_left_for_block_start(&self, index: usize, mut depth: usize) -> Option<usize> {
        let mut i = index;
        for _ in 0..Self::scan_limit() {
            let m = self.load(i);
            if m.is_block_start() {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            } else if m.is_block_end() {
                depth += 1;
            }
            i = i.checked_sub(1)?;
        }
        None
    }

    /// Mirror image of [`Self::scan_left_for_block_start`].
    fn scan_right_for_block_end(&self, index: usize, mut depth: usize) -> Option<usize> {
        let mut i = index;
        let count = self.granule_count();
        for _ in 0..Self::scan_limit() {
            if i >= count {
                return None;
            }
            let m = self.load(i);
            if m.is_block_end() {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            } else if m.is_block_start() {
                depth += 1;
            }
            i += 1;
        }
        None
    }

    fn innermost_start(&self, index: usize) -> Option<usize> {
        if self.load(index).is_block_start() {
            return Some(index);
        }
        self.scan_left_for_block_start(index.checked_sub(1)?, 0)
    }

    fn innermost_end(&self, index: usize) -> Option<usize> {
        if self.load(index).is_block_end() {
            return Some(index);
        }
        self.scan_right_for_block_end(index + 1, 0)
    }

    /// Start address of the innermost block whose span covers `addr`.
    pub fn find_block_beginning(&self, addr: usize) -> Option<usize> {
        let index = self.index(addr)?;
        self.innermost_start(index).map(|i| self.granule_addr(i))
    }

    /// Given an address inside a block's left redzone, find that block's header.
    pub fn asan_pointer_to_block_header(&self, addr: usize) -> Option<usize> {
        let index = self.index(addr)?;
        let mut i = index;
        for _ in 0..Self::scan_limit() {
            let m = self.load(i);
            if m.is_block_start() {
                return Some(self.granule_addr(i));
            }
            if m != ShadowMarker::LEFT_REDZONE {
                return None;
            }
            i = i.checked_sub(1)?;
        }
        None
    }

    fn block_info_from_bounds(&self, start: usize, end: usize) -> Option<CompactBlockInfo> {
        let first = self.load(start);
        let last = self.load(end);
        if !first.is_block_start()
            || !last.is_block_end()
            || first.is_nested_block_start() != last.is_nested_block_end()
            || end <= start
        {
            return None;
        }

        let mut left = 1;
        while start + left < end && self.load(start + left) == ShadowMarker::LEFT_REDZONE {
            left += 1;
        }
        let mut right = 1;
        while end - right > start + left - 1
            && self.load(end - right) == ShadowMarker::RIGHT_REDZONE
        {
            right += 1;
        }

        let granules = end - start + 1;
        let body_granules = granules - left - right;
        let tail = first.block_start_data() as usize;
        let block_size = granules << SHADOW_RATIO_LOG;
        let header_size = left << SHADOW_RATIO_LOG;
        let body_size = if tail == 0 || body_granules == 0 {
            body_granules << SHADOW_RATIO_LOG
        } else {
            ((body_granules - 1) << SHADOW_RATIO_LOG) + tail
        };
        Some(CompactBlockInfo {
            block: self.granule_addr(start),
            block_size,
            header_size,
            trailer_size: block_size - header_size - body_size,
            is_nested: first.is_nested_block_start(),
        })
    }

    /// Recover the innermost block covering `addr` from markers alone.
    pub fn block_info_from_shadow(&self, addr: usize) -> Option<CompactBlockInfo> {
        let index = self.index(addr)?;
        let start = self.innermost_start(index)?;
        let end = self.innermost_end(index)?;
        self.block_info_from_bounds(start, end)
    }

    /// The block directly enclosing a nested block.
    pub fn parent_block_info_from_shadow(
        &self,
        child: &CompactBlockInfo,
    ) -> Option<CompactBlockInfo> {
        if !child.is_nested {
            return None;
        }
        let child_start = self.index(child.block)?;
        let child_end = self.index(child.end() - 1)?;
        let start = self.scan_left_for_block_start(child_start.checked_sub(1)?, 0)?;
        let end = self.scan_right_for_block_end(child_end + 1, 0)?;
        self.block_info_from_bounds(start, end)
    }

    /// Size of a null-terminated array of `T` starting at `addr`, terminator
    /// included, scanning at most `max_size` bytes.
    ///
    /// Only accessible bytes are read. If an inaccessible byte is reached
    /// before a terminator, its offset is returned as the error. Scanning
    /// `max_size` accessible bytes without a terminator is a bounded success,
    /// `Ok` with the bytes covered by whole elements.
    pub fn get_null_terminated_array_size<T>(
        &self,
        addr: usize,
        max_size: usize,
    ) -> Result<usize, usize> {
        let elem = core::mem::size_of::<T>().max(1);
        let mut offset = 0;
        while offset + elem <= max_size {
            let cursor = addr + offset;
            if let Some(bad) = self.find_first_poisoned_byte(cursor, elem) {
                return Err(bad - addr);
            }
            if !self.contains(cursor + elem - 1) {
                return Err(offset);
            }
            // Accessible per shadow, hence mapped.
            let bytes = unsafe { core::slice::from_raw_parts(cursor as *const u8, elem) };
            if bytes.iter().all(|&b| b == 0) {
                return Ok(offset + elem);
            }
            offset += elem;
        }
        Ok(offset)
    }

    /// Render the markers around `addr`, with the granule of `addr` bracketed,
    /// followed by a legend.
    pub fn shadow_text(&self, addr: usize) -> String {
        const ROW: usize = 8;
        const ROWS_AROUND: usize = 4;

        let mut out = String::from("Shadow bytes around the buggy address:\n");
        let Some(index) = self.index(addr) else {
            let _ = writeln!(out, "  {:#x} is outside the shadowed range", addr);
            return out;
        };
        let row = index / ROW;
        let first = row.saturating_sub(ROWS_AROUND);
        let last = (row + ROWS_AROUND).min((self.granule_count() - 1) / ROW);
        for r in first..=last {
            let prefix = if r == row { "=>" } else { "  " };
            let _ = write!(out, "{}{:#014x}:", prefix, self.granule_addr(r * ROW));
            for i in r * ROW..(r * ROW + ROW).min(self.granule_count()) {
                let m = self.load(i);
                if i == index {
                    let _ = write!(out, "[{}]", m);
                } else if i == index + 1 {
                    let _ = write!(out, "{}", m);
                } else {
                    let _ = write!(out, " {}", m);
                }
            }
            out.push('\n');
        }
        out.push_str("Shadow byte legend (one shadow byte represents 8 application bytes):\n");
        let _ = writeln!(out, "  Partially addressable: 01 02 03 04 05 06 07");
        for (name, m) in marker::LEGEND {
            let _ = writeln!(out, "  {}: {}", name, m);
        }
        out
    }
}

impl Drop for Shadow {
    fn drop(&mut self) {
        if let Some(base) = NonNull::new(self.base as *mut u8) {
            // SAFETY: the window was mapped in `setup` and nothing outlives it.
            unsafe { platform::unmap_window(base, self.size) };
        }
    }
}
