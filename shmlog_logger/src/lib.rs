//! shmlog Logger
//!
//! Crash-safe logging pipeline for many producers feeding one logger:
//!
//! - [`DataLogger`] drains an unbounded ingress channel with a pool of
//!   worker threads, writing every item to its own message file
//! - [`LogProducer`] submits from other threads, [`RemoteProducer`] from
//!   other processes over the logger's Unix socket
//! - with `runtime = "process"` the workers run in `shmlog` child processes
//!   fed over their own sockets ([`run_attached`])
//! - [`assemble_log_archives`] merges message files into one archive per source
//! - [`ArchiveReader`] iterates or batches an archive in timestamp order
//!
//! Shutdown is coordinated through a
//! [`TerminationFlag`](shmlog_shared_memory::TerminationFlag), so any
//! process can stop a logger by name.
//!
//! # Example
//!
//! ```no_run
//! use shmlog_logger::{ArchiveReader, AssemblyOptions, DataLogger, LogItem, LoggerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut logger = DataLogger::new(LoggerConfig::new("/tmp/shmlog"))?;
//! logger.start()?;
//! logger.submit(LogItem::new(1, 100, vec![1, 2, 3]))?;
//! logger.stop()?;
//!
//! let report = shmlog_logger::assemble_log_archives(logger.log_directory(), &AssemblyOptions::default())?;
//! for archive in report.into_result()? {
//!     let reader = ArchiveReader::open(&archive.path)?;
//!     for message in reader.iter_messages(None)? {
//!         let message = message?;
//!         println!("{} {:?}", message.timestamp_us, message.payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
mod channel;
pub mod config;
pub mod error;
mod ingress;
pub mod item;
mod logger;
mod process;
mod sink;
mod watchdog;
mod worker;

pub use archive::{
    ArchiveFile, ArchiveReader, ArchiveWriter, AssemblyReport, Message, Onset, OnsetSource,
    SourceArchive, archive_path, assemble_log_archives,
};
pub use channel::LogProducer;
pub use config::{AssemblyOptions, LoggerConfig, RuntimeMode, SessionInfo, ShmlogConfig};
pub use error::{ArchiveError, ArchiveResult, LoggerError, LoggerResult};
pub use ingress::RemoteProducer;
pub use item::{LogItem, MessageKey};
pub use logger::{DataLogger, LoggerHealth};
pub use process::run_attached;
pub use worker::WorkerState;
