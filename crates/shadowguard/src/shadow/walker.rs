use super::{CompactBlockInfo, Shadow};
use crate::util::SHADOW_RATIO_LOG;

/// Iterates the blocks of a range in address order using shadow markers.
///
/// A non-recursive walker yields only the outermost blocks it meets and jumps
/// over their contents; a recursive one also descends into nested blocks.
/// Blocks are yielded as the markers read at the time of the step, so a walk
/// concurrent with other threads sees each block either before or after its
/// update.
pub struct ShadowWalker<'a> {
    shadow: &'a Shadow,
    recursive: bool,
    cursor: usize,
    end: usize,
}

impl<'a> ShadowWalker<'a> {
    /// Walk the blocks starting inside `[lower, upper)`.
    pub fn new(shadow: &'a Shadow, recursive: bool, lower: usize, upper: usize) -> Self {
        let lower = lower.clamp(shadow.base(), shadow.end());
        let upper = upper.clamp(lower, shadow.end());
        ShadowWalker {
            shadow,
            recursive,
            cursor: (lower - shadow.base()) >> SHADOW_RATIO_LOG,
            end: (upper - shadow.base()) >> SHADOW_RATIO_LOG,
        }
    }

    /// Walk the whole heap area of the window.
    pub fn heap(shadow: &'a Shadow, recursive: bool) -> Self {
        let bounds = shadow.heap_bounds();
        Self::new(shadow, recursive, bounds.start, bounds.end)
    }
}

impl Iterator for ShadowWalker<'_> {
    type Item = CompactBlockInfo;

    fn next(&mut self) -> Option<CompactBlockInfo> {
        while self.cursor < self.end {
            let start = self.cursor;
            self.cursor += 1;
            if !self.shadow.load(start).is_block_start() {
                continue;
            }
            // A torn or half-written block is skipped rather than ending the walk.
            let Some(end) = self.shadow.innermost_end(start) else {
                continue;
            };
            let Some(info) = self.shadow.block_info_from_bounds(start, end) else {
                continue;
            };
            if !self.recursive {
                self.cursor = end + 1;
            }
            return Some(info);
        }
        None
    }
}
