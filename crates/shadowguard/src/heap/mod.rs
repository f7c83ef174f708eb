//! Backing heaps: where block memory actually comes from.

pub mod region;
pub mod size_class;

use core::ptr::NonNull;

pub use region::{Region, RegionHeap};

/// A native heap the manager carves blocks out of.
///
/// Memory handed out must be 8-aligned and lie inside the shadowed window.
pub trait BackingHeap: Send + Sync {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;
    /// Return `ptr` to the heap. `false` if the heap does not own it.
    fn free(&self, ptr: NonNull<u8>) -> bool;
    /// Usable size of a live allocation, `None` if the heap does not own it.
    fn size(&self, ptr: NonNull<u8>) -> Option<usize>;

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.size(ptr).is_some()
    }
}
