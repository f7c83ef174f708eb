/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Number of bytes covered by one shadow marker.
pub const SHADOW_RATIO: usize = 8;

/// log2(SHADOW_RATIO).
pub const SHADOW_RATIO_LOG: u32 = 3;

/// Minimum alignment of every block and of every user pointer.
pub const MIN_ALIGN: usize = SHADOW_RATIO;

/// Largest alignment a caller may request.
pub const MAX_ALIGN: usize = 1 << 20;

/// Low part of the window that is never handed out and always reports
/// `InvalidAddress`.
pub const ADDRESS_LOWER_BOUND: usize = 64 * 1024;

/// Upper limit on the size of the shadow window.
pub const MAX_WINDOW_SIZE: usize = 1 << 31;

/// User sizes are stored in 30 bits.
pub const MAX_BODY_SIZE: usize = (1 << 30) - 1;

/// Bound on any block footprint; also bounds every shadow scan.
pub const MAX_BLOCK_SIZE: usize = 1 << 31;

/// Default quarantine size in bytes.
pub const DEFAULT_QUARANTINE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Default largest block that may enter the quarantine.
pub const DEFAULT_QUARANTINE_BLOCK_BYTES: usize = 4 * 1024 * 1024; // 4 MiB

/// Default number of quarantine shards.
pub const DEFAULT_SHARDING_FACTOR: usize = 16;

/// Default size of the shadow-covered window.
pub const DEFAULT_WINDOW_BYTES: usize = 256 * 1024 * 1024; // 256 MiB

/// Default depth of captured stacks.
pub const DEFAULT_MAX_NUM_FRAMES: usize = 62;

/// Fill byte for header padding.
pub const HEADER_PADDING_BYTE: u8 = 0x1C;

/// Fill byte for trailer padding.
pub const TRAILER_PADDING_BYTE: u8 = 0xC3;

/// splitmix64 finalizer.
#[inline]
pub const fn mix64(key: u64) -> u64 {
    let mut x = key;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// Hash a byte range 8 bytes at a time, folding the tail.
///
/// Stable across runs: block checksums must be recomputable by anything that
/// inspects a block later.
pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = mix64(seed ^ bytes.len() as u64);
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        h = mix64(h ^ u64::from_le_bytes(word));
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut word = [0u8; 8];
        word[..rest.len()].copy_from_slice(rest);
        h = mix64(h ^ u64::from_le_bytes(word) ^ 0xff);
    }
    h
}
