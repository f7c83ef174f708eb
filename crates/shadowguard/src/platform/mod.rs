//! The little the engine needs from the OS: one big anonymous mapping, page
//! discarding, thread ids and a coarse clock.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as sys;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as sys;

use core::ptr::{self, NonNull};
use std::sync::OnceLock;
use std::time::Instant;

/// Map `size` bytes of zeroed read-write memory for a shadow window.
/// Returns `None` and logs the OS error if the mapping fails.
pub fn map_window(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping aliases nothing.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            sys::WINDOW_MAP_FLAGS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        log::warn!(
            "mmap of {} bytes failed: {}",
            size,
            std::io::Error::last_os_error()
        );
        return None;
    }
    NonNull::new(base.cast())
}

/// # Safety
/// `base` and `size` must describe a mapping from [`map_window`], and nothing
/// may touch it afterwards.
pub unsafe fn unmap_window(base: NonNull<u8>, size: usize) {
    if libc::munmap(base.as_ptr().cast(), size) != 0 {
        log::warn!("munmap at {:p} failed: {}", base, std::io::Error::last_os_error());
    }
}

/// Let the kernel reclaim the pages of an unused range.
///
/// # Safety
/// The range must be page-aligned, mapped and hold nothing anyone will read
/// before rewriting it.
pub unsafe fn discard_pages(addr: usize, size: usize) {
    let ret = libc::madvise(addr as *mut libc::c_void, size, sys::DISCARD_ADVICE);
    debug_assert!(ret == 0, "madvise failed on {addr:#x}+{size}");
}

pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    })
}

/// Identifier of the calling thread, truncated to the width of the trailer
/// fields that store it.
#[inline]
pub fn thread_id() -> u32 {
    sys::thread_id() as u32
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds since the first call, truncated to 32 bits like the trailer
/// fields that store it.
#[inline]
pub fn ticks() -> u32 {
    epoch().elapsed().as_millis() as u32
}
