//! Process-scoped setup and teardown.
//!
//! A [`Runtime`] maps the window, builds the stack cache, region and heap
//! manager from one set of [`Parameters`], and creates the process heap.
//! Dropping it flushes the quarantine, returns every heap and unmaps the
//! window, in that order.

use crate::classify::ErrorInfo;
use crate::config::Parameters;
use crate::error::{AccessMode, Error};
use crate::heap::Region;
use crate::manager::{HeapId, HeapManager};
use crate::nested;
use crate::report::{ErrorSink, LogSink};
use crate::shadow::Shadow;
use crate::stack::StackCache;
use core::ptr::NonNull;
use std::sync::Arc;

pub struct Runtime {
    manager: HeapManager,
    stacks: Arc<StackCache>,
    shadow: Arc<Shadow>,
    process_heap: HeapId,
}

impl Runtime {
    /// Set up with parameters from `SHADOWGUARD_OPTIONS`, reporting through
    /// the log.
    pub fn from_env() -> Result<Runtime, Error> {
        Runtime::new(Parameters::from_env()?)
    }

    pub fn new(params: Parameters) -> Result<Runtime, Error> {
        Runtime::with_sink(params, Arc::new(LogSink))
    }

    pub fn with_sink(mut params: Parameters, sink: Arc<dyn ErrorSink>) -> Result<Runtime, Error> {
        params.validate()?;
        let shadow = Arc::new(Shadow::setup(params.shadow_window_size)?);
        let region = Arc::new(Region::new(shadow.heap_bounds()));
        let stacks = Arc::new(StackCache::new(
            params.max_num_frames,
            params.bottom_frames_to_skip,
        ));
        let manager = HeapManager::new(shadow.clone(), region, stacks.clone(), sink, params);
        let process_heap = manager.create_heap();
        log::debug!(
            "runtime ready: window {:#x}..{:#x}, process heap {}",
            shadow.base(),
            shadow.end(),
            process_heap
        );
        Ok(Runtime {
            manager,
            stacks,
            shadow,
            process_heap,
        })
    }

    pub fn manager(&self) -> &HeapManager {
        &self.manager
    }

    pub fn shadow(&self) -> &Shadow {
        &self.shadow
    }

    pub fn stacks(&self) -> &StackCache {
        &self.stacks
    }

    pub fn process_heap(&self) -> HeapId {
        self.process_heap
    }

    /// Allocate from the process heap.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, Error> {
        self.manager.allocate(self.process_heap, bytes)
    }

    pub fn allocate_aligned(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, Error> {
        self.manager.allocate_aligned(self.process_heap, bytes, alignment)
    }

    /// Free to the process heap.
    pub fn free(&self, ptr: *mut u8) -> Result<(), Error> {
        self.manager.free(self.process_heap, ptr)
    }

    pub fn realloc(&self, ptr: Option<NonNull<u8>>, bytes: usize) -> Result<NonNull<u8>, Error> {
        self.manager.realloc(self.process_heap, ptr, bytes)
    }

    pub fn size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.manager.size(self.process_heap, ptr)
    }

    /// Diagnose a faulting access.
    pub fn report_bad_access(&self, addr: usize, mode: AccessMode, size: usize) -> ErrorInfo {
        self.manager.report_heap_error(addr, mode, size)
    }

    // ------------------------------------------------------------------
    // Caller-managed objects
    // ------------------------------------------------------------------

    /// See [`nested::initialize_object`].
    ///
    /// # Safety
    /// Same contract as [`nested::initialize_object`].
    pub unsafe fn initialize_object(
        &self,
        raw: *mut u8,
        user_size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, Error> {
        nested::initialize_object(&self.shadow, self.stacks.as_ref(), raw, user_size, alignment)
    }

    /// # Safety
    /// Same contract as [`nested::quarantine_object`].
    pub unsafe fn quarantine_object(&self, raw: *mut u8) -> Result<(), Error> {
        nested::quarantine_object(&self.shadow, self.stacks.as_ref(), raw)
    }

    /// # Safety
    /// Same contract as [`nested::destroy_object`].
    pub unsafe fn destroy_object(&self, raw: *mut u8) -> Result<(), Error> {
        nested::destroy_object(&self.shadow, self.stacks.as_ref(), raw)
    }

    /// # Safety
    /// Same contract as [`nested::clone_object`].
    pub unsafe fn clone_object(&self, src: *mut u8, dst: *mut u8) -> Result<NonNull<u8>, Error> {
        nested::clone_object(&self.shadow, self.stacks.as_ref(), src, dst)
    }

    pub fn poison_memory_range(&self, addr: usize, size: usize) {
        nested::poison_memory_range(&self.shadow, addr, size);
    }

    pub fn unpoison_memory_range(&self, addr: usize, size: usize) {
        nested::unpoison_memory_range(&self.shadow, addr, size);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        log::debug!(
            "tearing down runtime: {} quarantined blocks, {} live stacks",
            self.manager.quarantine_len(),
            self.stacks.len()
        );
    }
}
