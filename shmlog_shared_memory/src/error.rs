//! Error types for shared buffer operations

use thiserror::Error;

/// Errors that can occur during shared buffer operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Region could not be allocated (already exists, or the OS refused)
    #[error("Cannot allocate shared buffer {name}: {reason}")]
    Allocation {
        /// Buffer name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Region does not exist
    #[error("Shared buffer not found: {name}")]
    NotFound {
        /// Buffer name
        name: String,
    },

    /// Existing region has a different shape or element type
    #[error("Layout mismatch for shared buffer {name}: expected {expected}, found {found}")]
    LayoutMismatch {
        /// Buffer name
        name: String,
        /// Layout the caller asked for
        expected: String,
        /// Layout stored in the region header
        found: String,
    },

    /// Region was destroyed
    #[error("Shared buffer {name} has been destroyed")]
    UseAfterDestroy {
        /// Buffer name
        name: String,
    },

    /// Handle was disconnected by its owner
    #[error("Shared buffer handle {name} is disconnected")]
    Detached {
        /// Buffer name
        name: String,
    },

    /// Cross-process lock not acquired within the bound
    #[error("Timed out after {timeout_ms} ms waiting for the lock of {name}")]
    LockTimeout {
        /// Buffer name
        name: String,
        /// Configured bound in milliseconds
        timeout_ms: u64,
    },

    /// Index or range outside the buffer
    #[error("Index {index} out of bounds for buffer of {len} elements")]
    OutOfBounds {
        /// Offending index (range end for ranges)
        index: usize,
        /// Buffer element count
        len: usize,
    },

    /// Value slice length differs from the addressed range
    #[error("Length mismatch: range holds {expected} elements, got {actual}")]
    LengthMismatch {
        /// Elements addressed
        expected: usize,
        /// Elements supplied
        actual: usize,
    },

    /// Buffer specification rejected before touching the OS
    #[error("Invalid buffer specification: {reason}")]
    InvalidSpec {
        /// Validation failure
        reason: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },
}

/// Result type for shared buffer operations
pub type ShmResult<T> = Result<T, ShmError>;
