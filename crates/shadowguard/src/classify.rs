//! Fault diagnosis: from an address to what went wrong there.

use crate::block::{
    find_containing_freed_block, is_block_corrupt, BlockInfo, BlockSnapshot, BlockState,
    BLOCK_HEADER_MAGIC,
};
use crate::error::{AccessMode, BadAccessKind};
use crate::platform;
use crate::shadow::{Shadow, ShadowMarker, ShadowWalker};
use crate::stack::StackId;
use core::time::Duration;

/// A run of adjacent corrupt blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptBlockRange {
    pub address: usize,
    pub length: usize,
    pub block_count: usize,
    pub first_block: BlockSnapshot,
}

impl CorruptBlockRange {
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.length
    }
}

/// Everything known about one bad access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: BadAccessKind,
    pub location: usize,
    pub access_mode: AccessMode,
    pub access_size: usize,
    /// The block the diagnosis is about. For an access inside a quarantined
    /// ancestor this is the ancestor.
    pub block: Option<BlockSnapshot>,
    pub time_since_free: Option<Duration>,
    pub crash_stack: Option<StackId>,
    pub heap_is_corrupt: bool,
    pub corrupt_ranges: Vec<CorruptBlockRange>,
    pub shadow_text: String,
}

impl ErrorInfo {
    pub fn new(kind: BadAccessKind, location: usize) -> ErrorInfo {
        ErrorInfo {
            kind,
            location,
            access_mode: AccessMode::Unknown,
            access_size: 0,
            block: None,
            time_since_free: None,
            crash_stack: None,
            heap_is_corrupt: false,
            corrupt_ranges: Vec::new(),
            shadow_text: String::new(),
        }
    }

    pub fn alloc_stack(&self) -> Option<StackId> {
        self.block.as_ref().and_then(|b| b.alloc_stack)
    }

    pub fn free_stack(&self) -> Option<StackId> {
        self.block.as_ref().and_then(|b| b.free_stack)
    }

    pub(crate) fn with_block(mut self, info: &BlockInfo) -> ErrorInfo {
        // SAFETY: blocks are only ever located inside the mapped window.
        let snapshot = unsafe { info.snapshot() };
        if snapshot.state.is_some_and(BlockState::is_freed) {
            let elapsed = platform::ticks().wrapping_sub(snapshot.free_ticks);
            self.time_since_free = Some(Duration::from_millis(elapsed as u64));
        }
        self.block = Some(snapshot);
        self
    }
}

/// Diagnose an access to `addr`.
pub fn classify(shadow: &Shadow, addr: usize) -> ErrorInfo {
    let diagnosis = |kind| ErrorInfo::new(kind, addr);

    let marker = match shadow.get_marker(addr) {
        None | Some(ShadowMarker::ASAN_INTERNAL) => return diagnosis(BadAccessKind::WildAccess),
        Some(ShadowMarker::INVALID_ADDRESS) => return diagnosis(BadAccessKind::InvalidAddress),
        Some(m) => m,
    };

    let Some(compact) = shadow.block_info_from_shadow(addr) else {
        return diagnosis(BadAccessKind::Unknown);
    };
    let Some(block) = BlockInfo::from_compact(&compact) else {
        log::debug!("shadow geometry at {addr:#x} is too small for a block");
        return diagnosis(BadAccessKind::CorruptHeap);
    };

    // SAFETY: the shadow places this block inside the window.
    let header = unsafe { block.header() };
    let state = match header.state() {
        Some(state) if header.magic == BLOCK_HEADER_MAGIC => state,
        _ => return diagnosis(BadAccessKind::CorruptHeap).with_block(&block),
    };

    if state.is_freed() {
        return diagnosis(BadAccessKind::UseAfterFree).with_block(&block);
    }
    if let Some(ancestor) = find_containing_freed_block(shadow, &block) {
        return diagnosis(BadAccessKind::UseAfterFree).with_block(&ancestor);
    }

    let kind = if addr < block.body {
        BadAccessKind::Underflow
    } else if addr >= block.body_end() {
        BadAccessKind::Overflow
    } else if marker == ShadowMarker::FREED {
        BadAccessKind::UseAfterFree
    } else {
        BadAccessKind::Unknown
    };
    diagnosis(kind).with_block(&block)
}

/// Validate every block in the heap area, nested ones included, and return
/// the corrupt ones grouped into contiguous ranges.
pub fn is_heap_corrupt(shadow: &Shadow) -> Vec<CorruptBlockRange> {
    let mut ranges: Vec<CorruptBlockRange> = Vec::new();
    for compact in ShadowWalker::heap(shadow, true) {
        let Some(info) = BlockInfo::from_compact(&compact) else {
            continue;
        };
        // SAFETY: the walker only yields blocks inside the window.
        if !unsafe { is_block_corrupt(&info) } {
            continue;
        }
        match ranges.last_mut() {
            Some(range) if info.block <= range.end() => {
                let end = range.end().max(info.end());
                range.length = end - range.address;
                range.block_count += 1;
            }
            _ => ranges.push(CorruptBlockRange {
                address: info.block,
                length: info.block_size,
                block_count: 1,
                // SAFETY: as above.
                first_block: unsafe { info.snapshot() },
            }),
        }
    }
    if !ranges.is_empty() {
        log::warn!("heap has {} corrupt range(s)", ranges.len());
    }
    ranges
}
