//! Error types for the logger runtime and the archive tools

use shmlog_common::config::ConfigError;
use shmlog_shared_memory::ShmError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by [`DataLogger`](crate::DataLogger) and its producers
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Termination flag failure
    #[error("Termination flag error: {0}")]
    Shm(#[from] ShmError),

    /// IO error outside per-item persistence
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The runtime panicked; the session is lost
    #[error("Logger runtime crashed with {undrained} items left in the queue")]
    RuntimeCrashed {
        /// Items still queued when the crash was observed
        undrained: usize,
    },

    /// Item violates the log item contract
    #[error("Invalid log item: {reason}")]
    InvalidItem {
        /// What is wrong with the item
        reason: String,
    },

    /// A runtime process never became ready
    #[error("Runtime process {index} failed to start: {reason}")]
    ProcessStart {
        /// Index of the runtime process
        index: usize,
        /// What went wrong
        reason: String,
    },

    /// A runtime thread or process could not be started
    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        /// Thread or process name
        name: String,
        /// Spawn error
        source: std::io::Error,
    },
}

/// Result type for logger operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Errors raised while assembling or reading archives
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File has the archive magic but its structure is broken
    #[error("Malformed archive {path}: {reason}")]
    Format {
        /// Archive path
        path: PathBuf,
        /// What is broken
        reason: String,
    },

    /// File is not an archive at all
    #[error("Not a shmlog archive: {path}")]
    NotAnArchive {
        /// Offending path
        path: PathBuf,
    },

    /// Verification found an entry that differs from its source
    #[error("Integrity check failed for source {source_id:03}: entry {key} differs from its source")]
    IntegrityMismatch {
        /// Source being assembled
        source_id: u8,
        /// First mismatching key
        key: String,
    },

    /// Requested key is not in the archive
    #[error("Key {key} not present in archive")]
    MissingKey {
        /// Requested key
        key: String,
    },
}

/// Result type for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;
