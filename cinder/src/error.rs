use std::fmt;

/// Recoverable failures surfaced to the embedder.
///
/// Invariant violations (mark stack overflow, to-space violations,
/// suspension timeouts, strict-mode stale handles) are not represented
/// here; they panic with a diagnostic, since continuing would corrupt the
/// heap for every later mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// Allocation failed after the whole retry ladder (collect, collect
    /// clearing soft references, homogeneous compaction).
    OutOfMemory { requested_words: usize },
    /// A handle decoded to something that is not a live table entry and
    /// strict checking is disabled.
    InvalidReference,
    /// A null object was passed where a reference is required.
    NullReference,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory { requested_words } => {
                write!(f, "out of memory: {requested_words} words requested")
            }
            GcError::InvalidReference => write!(f, "invalid reference"),
            GcError::NullReference => write!(f, "null reference"),
        }
    }
}

impl std::error::Error for GcError {}
