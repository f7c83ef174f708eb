pub const WINDOW_MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// Pages are reclaimed lazily; contents are undefined until rewritten.
pub const DISCARD_ADVICE: libc::c_int = libc::MADV_FREE;

#[inline]
pub fn thread_id() -> u64 {
    let mut tid = 0u64;
    // SAFETY: a null thread handle means the calling thread.
    unsafe { libc::pthread_threadid_np(0, &mut tid) };
    tid
}
