/// The window is mostly untouched address space; don't reserve swap for it.
pub const WINDOW_MAP_FLAGS: libc::c_int =
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

/// Dropped pages read back as zero on the next touch.
pub const DISCARD_ADVICE: libc::c_int = libc::MADV_DONTNEED;

/// Kernel thread id, looked up once per thread.
#[inline]
pub fn thread_id() -> u64 {
    use std::cell::Cell;

    thread_local! {
        static TID: Cell<u64> = const { Cell::new(0) };
    }

    TID.with(|tid| {
        if tid.get() == 0 {
            // SAFETY: gettid has no preconditions.
            tid.set(unsafe { libc::syscall(libc::SYS_gettid) } as u64);
        }
        tid.get()
    })
}
