//! Where diagnoses go.

use crate::classify::ErrorInfo;
use crate::sync::Mutex;
use core::fmt::Write as _;

/// Receives every diagnosis the engine produces.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &ErrorInfo);
}

/// Render a diagnosis the way [`LogSink`] prints it.
pub fn render(error: &ErrorInfo) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "SHADOWGUARD error: {} on address {:#x} ({:?}",
        error.kind, error.location, error.access_mode
    );
    if error.access_size > 0 {
        let _ = write!(out, " of {} bytes", error.access_size);
    }
    out.push_str(")\n");

    if let Some(block) = &error.block {
        let _ = writeln!(
            out,
            "{:#x} is located {} bytes inside of a {}-byte region [{:#x},{:#x})",
            error.location,
            error.location as isize - block.body as isize,
            block.body_size,
            block.body,
            block.body + block.body_size,
        );
        if let Some(id) = block.alloc_stack {
            let _ = writeln!(out, "allocated by thread {} at stack {}", block.alloc_tid, id);
        }
        if let Some(id) = block.free_stack {
            let _ = write!(out, "freed by thread {} at stack {}", block.free_tid, id);
            if let Some(ago) = error.time_since_free {
                let _ = write!(out, ", {} ms ago", ago.as_millis());
            }
            out.push('\n');
        }
        if block.is_nested {
            out.push_str("the block is nested inside another block\n");
        }
    }

    if error.heap_is_corrupt {
        let _ = writeln!(out, "the heap is corrupt ({} range(s)):", error.corrupt_ranges.len());
        for range in &error.corrupt_ranges {
            let _ = writeln!(
                out,
                "  {:#x}..{:#x}: {} block(s)",
                range.address,
                range.end(),
                range.block_count
            );
        }
    }
    out.push_str(&error.shadow_text);
    out
}

/// Prints each diagnosis through `log::error!`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, error: &ErrorInfo) {
        log::error!("{}", render(error));
    }
}

/// Keeps every diagnosis in memory.
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ErrorInfo>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn reports(&self) -> Vec<ErrorInfo> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<ErrorInfo> {
        core::mem::take(&mut *self.reports.lock())
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, error: &ErrorInfo) {
        self.reports.lock().push(error.clone());
    }
}
