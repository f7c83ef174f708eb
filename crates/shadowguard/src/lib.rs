//! Shadow-memory heap instrumentation.
//!
//! Every allocation is wrapped in a block: a header and left redzone before
//! the user bytes, a right redzone and trailer after them. One shadow byte per
//! 8 bytes of the window records which bytes user code may touch. Freed
//! blocks wait in a sharded quarantine before going back to their heap, so
//! stale pointers hit poisoned memory, and a faulting address can be traced
//! back to the block it belongs to.

pub mod block;
pub mod classify;
pub mod config;
pub mod error;
pub mod heap;
pub mod manager;
pub mod nested;
pub mod platform;
pub mod quarantine;
pub mod report;
pub mod runtime;
pub mod shadow;
pub mod stack;
pub mod sync;
pub mod util;

pub use block::{BlockInfo, BlockSnapshot, BlockState};
pub use classify::{classify, is_heap_corrupt, CorruptBlockRange, ErrorInfo};
pub use config::Parameters;
pub use error::{AccessMode, BadAccessKind, ConfigError, Error};
pub use heap::{BackingHeap, Region, RegionHeap};
pub use manager::{HeapId, HeapManager};
pub use report::{ErrorSink, LogSink, RecordingSink};
pub use runtime::Runtime;
pub use shadow::{Shadow, ShadowMarker};
pub use stack::{StackCache, StackId, StackProvider};
