//! Per-message file persistence

use crate::item::LogItem;
use shmlog_common::consts::PARTIAL_SUFFIX;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Destination of persisted items. Called concurrently by every worker.
pub(crate) trait MessageSink: Send + Sync {
    fn persist(&self, item: &LogItem) -> io::Result<()>;
}

/// Writes each item's payload verbatim to its own file in the log directory.
///
/// The payload goes to a uniquely named partial file first and is renamed
/// into place, so a message file is either complete or absent.
#[derive(Debug)]
pub(crate) struct FileSink {
    dir: PathBuf,
    sync: bool,
    sequence: AtomicU64,
}

impl FileSink {
    pub(crate) fn new(dir: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            dir: dir.into(),
            sync,
            sequence: AtomicU64::new(0),
        }
    }

    fn write_partial(&self, partial: &Path, payload: &[u8]) -> io::Result<()> {
        let mut file = File::create(partial)?;
        file.write_all(payload)?;
        if self.sync {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl MessageSink for FileSink {
    fn persist(&self, item: &LogItem) -> io::Result<()> {
        let name = item.key().file_name();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let partial = self.dir.join(format!("{name}.{seq}.{PARTIAL_SUFFIX}"));

        let result = self
            .write_partial(&partial, &item.payload)
            .and_then(|()| fs::rename(&partial, self.dir.join(&name)));
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}
