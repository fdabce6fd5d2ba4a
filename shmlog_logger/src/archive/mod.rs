//! Per-source archives: container format, offline assembly and reading.

mod assembler;
pub mod format;
mod reader;

pub use assembler::{AssemblyReport, SourceArchive, archive_path, assemble_log_archives};
pub use format::{ArchiveFile, ArchiveWriter};
pub use reader::{ArchiveReader, Message, Onset, OnsetSource};
