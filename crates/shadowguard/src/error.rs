use core::fmt;

/// Failures returned by the engine's operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backing heap could not satisfy a {0}-byte request")]
    OutOfMemory(usize),
    #[error("alignment {0} is not a supported power of two")]
    InvalidAlignment(usize),
    #[error("{0} bytes exceed the largest encodable block")]
    SizeTooLarge(usize),
    #[error("{0:#x} is not a block owned by this heap")]
    InvalidPointer(usize),
    #[error("attempting double-free of {0:#x}")]
    DoubleFree(usize),
    #[error("corrupt block at {0:#x}")]
    CorruptBlock(usize),
    #[error("unknown heap id {0}")]
    UnknownHeap(u32),
    #[error("window size {0:#x} is not usable")]
    InvalidWindow(usize),
    #[error("failed to map {0} bytes")]
    MapFailed(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures while reading runtime options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown option \"{0}\"")]
    UnknownOption(String),
    #[error("failed to parse \"{name}\" value of \"{value}\"")]
    InvalidValue { name: String, value: String },
    #[error("\"{name}\" must be {constraint}")]
    OutOfRange {
        name: &'static str,
        constraint: &'static str,
    },
}

/// What went wrong with a memory access or a heap operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BadAccessKind {
    Overflow,
    Underflow,
    UseAfterFree,
    WildAccess,
    InvalidAddress,
    /// Heap metadata too damaged to classify the access.
    CorruptHeap,
    /// A block failed validation while being freed.
    CorruptBlock,
    DoubleFree,
    Unknown,
}

impl BadAccessKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BadAccessKind::Overflow => "heap-buffer-overflow",
            BadAccessKind::Underflow => "heap-buffer-underflow",
            BadAccessKind::UseAfterFree => "heap-use-after-free",
            BadAccessKind::WildAccess => "wild-access",
            BadAccessKind::InvalidAddress => "invalid-address",
            BadAccessKind::CorruptHeap => "corrupt-heap",
            BadAccessKind::CorruptBlock => "corrupt-block",
            BadAccessKind::DoubleFree => "attempting double-free",
            BadAccessKind::Unknown => "heap-unknown-error",
        }
    }
}

impl fmt::Display for BadAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of the faulting access, as seen by the fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessMode {
    Read,
    Write,
    #[default]
    Unknown,
}
