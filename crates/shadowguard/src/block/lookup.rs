use super::{BlockInfo, BlockState};
use crate::shadow::Shadow;
use core::ptr;

/// Walk the chain of blocks enclosing `inner`, nearest first, and return the
/// first whose header state satisfies `accept`. Ancestors with unreadable
/// headers are skipped, not treated as the end of the chain.
fn find_ancestor(
    shadow: &Shadow,
    inner: &BlockInfo,
    accept: impl Fn(BlockState) -> bool,
) -> Option<BlockInfo> {
    let mut current = inner.compact();
    while let Some(parent) = shadow.parent_block_info_from_shadow(&current) {
        if let Some(info) = BlockInfo::from_compact(&parent) {
            // Shadow says a block lives here, so its header is mapped.
            let header = unsafe { ptr::read(info.header_ptr()) };
            if header.state().is_some_and(&accept) {
                return Some(info);
            }
        }
        current = parent;
    }
    None
}

/// Nearest allocated or quarantined block enclosing a nested block.
pub fn find_containing_block(shadow: &Shadow, inner: &BlockInfo) -> Option<BlockInfo> {
    find_ancestor(shadow, inner, |s| {
        matches!(s, BlockState::Allocated | BlockState::Quarantined)
    })
}

/// Nearest quarantined or freed block enclosing a nested block.
pub fn find_containing_freed_block(shadow: &Shadow, inner: &BlockInfo) -> Option<BlockInfo> {
    find_ancestor(shadow, inner, BlockState::is_freed)
}
