use std::{error::Error, fmt};

/// Failures reported by a [`crate::kernel::PlatformMemory`] implementation.
///
/// The memory manager treats [`AllocError::MapFailed`] as fatal. The other
/// variants are surfaced from the protection calls or logged on teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused to map a new slab.
    MapFailed { size: usize, reason: String },
    /// Changing page protection of a slab failed.
    ProtectFailed { base: usize, size: usize, reason: String },
    /// Returning a slab to the OS failed.
    ReleaseFailed { base: usize, size: usize, reason: String },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::MapFailed { size, reason } => {
                write!(f, "failed to map {size} bytes of executable memory: {reason}")
            }
            AllocError::ProtectFailed { base, size, reason } => {
                write!(
                    f,
                    "failed to change protection of {size} bytes at {base:#x}: {reason}"
                )
            }
            AllocError::ReleaseFailed { base, size, reason } => {
                write!(f, "failed to release {size} bytes at {base:#x}: {reason}")
            }
        }
    }
}

impl Error for AllocError {}
