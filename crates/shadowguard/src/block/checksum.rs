use super::{
    BlockInfo, BlockState, BLOCK_HEADER_MAGIC, BLOCK_TRAILER_MAGIC, CHECKSUM_BITS, CHECKSUM_MASK,
    HEADER_SIZE, TRAILER_SIZE,
};
use crate::util::{hash_bytes, SHADOW_RATIO};
use core::{ptr, slice};

const HEADER_SEED: u64 = 0x5348_4144_4f57_4844;
const TRAILER_SEED: u64 = 0x5348_4144_4f57_5452;

/// Why a block failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlockCorruption {
    #[error("bad header magic {0:#06x}")]
    HeaderMagic(u16),
    #[error("bad trailer magic {0:#06x}")]
    TrailerMagic(u16),
    #[error("invalid block state {0}")]
    InvalidState(u8),
    #[error("header size {header} does not match block geometry {geometry}")]
    SizeMismatch { header: usize, geometry: usize },
    #[error("padding length words disagree with block geometry")]
    Padding,
    #[error("stack ids inconsistent with {0:?} state")]
    StackState(BlockState),
    #[error("checksum {stored:#06x} != computed {computed:#06x}")]
    Checksum { stored: u16, computed: u16 },
}

#[inline]
unsafe fn bytes<'a>(start: usize, end: usize) -> &'a [u8] {
    slice::from_raw_parts(start as *const u8, end - start)
}

/// Fold a 64-bit hash into the checksum width.
#[inline]
fn fold(mut h: u64) -> u16 {
    let mut c = 0u16;
    while h != 0 {
        c ^= (h as u16) & CHECKSUM_MASK;
        h >>= CHECKSUM_BITS;
    }
    c
}

/// Checksum of a block as it currently sits in memory.
///
/// Allocated blocks hash their metadata only (header, header padding,
/// trailer padding, trailer): the body belongs to the user. Quarantined and
/// freed blocks hash everything, so writes through dangling pointers show up.
/// The stored checksum bits are excluded from the hash.
///
/// # Safety
/// `info` must describe mapped memory.
pub unsafe fn calculate_checksum(info: &BlockInfo) -> u16 {
    let mut header = ptr::read(info.header_ptr());
    header.set_checksum(0);
    let header_bytes = slice::from_raw_parts(&header as *const _ as *const u8, HEADER_SIZE);
    let h1 = hash_bytes(
        hash_bytes(HEADER_SEED, header_bytes),
        bytes(info.block + HEADER_SIZE, info.body),
    );
    let tail_start = match header.state() {
        Some(BlockState::Allocated) => info.body_end(),
        _ => info.body,
    };
    let h2 = hash_bytes(TRAILER_SEED, bytes(tail_start, info.end()));
    fold(h1 ^ h2)
}

/// Store a fresh checksum in the header.
///
/// # Safety
/// `info` must describe a block owned by the caller.
pub unsafe fn set_checksum(info: &BlockInfo) {
    let checksum = calculate_checksum(info);
    (*info.header_ptr()).set_checksum(checksum);
}

/// Check every invariant of a block's metadata against its geometry.
///
/// # Safety
/// `info` must describe mapped memory.
pub unsafe fn validate(info: &BlockInfo) -> Result<(), BlockCorruption> {
    let header = ptr::read(info.header_ptr());
    if header.magic != BLOCK_HEADER_MAGIC {
        return Err(BlockCorruption::HeaderMagic(header.magic));
    }
    let trailer = ptr::read(info.trailer_ptr());
    if trailer.magic != BLOCK_TRAILER_MAGIC {
        return Err(BlockCorruption::TrailerMagic(trailer.magic));
    }
    let state = header
        .state()
        .ok_or(BlockCorruption::InvalidState(header.raw_state()))?;
    if header.body_size() != info.body_size {
        return Err(BlockCorruption::SizeMismatch {
            header: header.body_size(),
            geometry: info.body_size,
        });
    }

    if header.has_header_padding() != (info.header_padding_size > 0) {
        return Err(BlockCorruption::Padding);
    }
    if info.header_padding_size > 0 {
        let head = ptr::read_unaligned((info.block + HEADER_SIZE) as *const u32) as usize;
        let tail = ptr::read_unaligned((info.body - 4) as *const u32) as usize;
        if head != info.header_padding_size || tail != info.header_padding_size {
            return Err(BlockCorruption::Padding);
        }
    }
    let implicit = (SHADOW_RATIO - info.body_size % SHADOW_RATIO) % SHADOW_RATIO;
    if header.has_excess_trailer_padding() != (info.trailer_padding_size > implicit) {
        return Err(BlockCorruption::Padding);
    }
    if header.has_excess_trailer_padding() {
        let len = ptr::read_unaligned(info.body_end() as *const u32) as usize;
        if len != info.trailer_padding_size {
            return Err(BlockCorruption::Padding);
        }
    }
    debug_assert_eq!(info.trailer_addr() + TRAILER_SIZE, info.end());

    let consistent = match state {
        BlockState::Allocated => header.raw_free_stack() == 0,
        BlockState::Quarantined | BlockState::Freed => header.raw_free_stack() != 0,
    };
    if !consistent {
        return Err(BlockCorruption::StackState(state));
    }

    let computed = calculate_checksum(info);
    if computed != header.checksum() {
        return Err(BlockCorruption::Checksum {
            stored: header.checksum(),
            computed,
        });
    }
    Ok(())
}

/// Whether [`validate`] finds anything wrong with the block.
///
/// # Safety
/// `info` must describe mapped memory.
#[inline]
pub unsafe fn is_block_corrupt(info: &BlockInfo) -> bool {
    validate(info).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mark_quarantined;
    use crate::block::tests::block_at;
    use crate::shadow::tests::test_shadow;
    use crate::stack::{StackCache, StackProvider};

    #[test]
    fn fresh_block_validates() {
        let s = test_shadow();
        let info = unsafe { block_at(&s, 0, 24, 32, false) };
        assert_eq!(unsafe { validate(&info) }, Ok(()));
    }

    #[test]
    fn allocated_checksum_ignores_body() {
        let s = test_shadow();
        let info = unsafe { block_at(&s, 0, 24, 8, false) };
        unsafe { ptr::write_bytes(info.body as *mut u8, 0x11, 24) };
        assert!(!unsafe { is_block_corrupt(&info) });
    }

    #[test]
    fn detects_header_and_trailer_damage() {
        let s = test_shadow();
        let info = unsafe { block_at(&s, 0, 24, 8, false) };
        unsafe { *((info.trailer_addr() + 4) as *mut u8) ^= 0x40 };
        assert!(matches!(
            unsafe { validate(&info) },
            Err(BlockCorruption::Checksum { .. })
        ));

        let info = unsafe { block_at(&s, 4096, 24, 8, false) };
        unsafe { *(info.block as *mut u8) = 0 };
        assert!(matches!(
            unsafe { validate(&info) },
            Err(BlockCorruption::HeaderMagic(_))
        ));
    }

    #[test]
    fn quarantined_checksum_covers_body() {
        let s = test_shadow();
        let stacks = StackCache::new(8, 0);
        let info = unsafe { block_at(&s, 0, 24, 8, false) };
        unsafe { mark_quarantined(&s, &info, Some(stacks.capture())) };
        assert!(!unsafe { is_block_corrupt(&info) });
        // Write through a dangling pointer.
        unsafe { *((info.body + 3) as *mut u8) ^= 1 };
        assert!(unsafe { is_block_corrupt(&info) });
    }

    #[test]
    fn stack_state_mismatch() {
        let s = test_shadow();
        let info = unsafe { block_at(&s, 0, 24, 8, false) };
        unsafe {
            (*info.header_ptr()).set_state(BlockState::Quarantined);
            crate::block::set_checksum(&info);
            assert_eq!(
                validate(&info),
                Err(BlockCorruption::StackState(BlockState::Quarantined))
            );
        }
    }
}
