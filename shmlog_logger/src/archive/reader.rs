//! Ordered, batched access to an assembled archive.

use super::assembler::decode_onset;
use super::format::ArchiveFile;
use crate::config::default_worker_count_for_host;
use crate::error::{ArchiveError, ArchiveResult};
use crate::item::MessageKey;
use serde::Serialize;
use shmlog_common::consts::MIN_PARALLEL_MESSAGES;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Where an onset value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnsetSource {
    /// The archive's onset entry.
    Recorded,
    /// Passed in by the caller.
    Provided,
    /// No onset entry: the smallest message key stands in for it, and
    /// timestamps are reported as elapsed microseconds.
    FirstMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Onset {
    pub timestamp_us: u64,
    pub source: OnsetSource,
}

impl Onset {
    /// Absolute timestamp of a message recorded `elapsed_us` after the onset.
    pub fn absolute(&self, elapsed_us: u64) -> u64 {
        match self.source {
            OnsetSource::FirstMessage => elapsed_us,
            OnsetSource::Recorded | OnsetSource::Provided => self.timestamp_us.saturating_add(elapsed_us),
        }
    }
}

/// One message as yielded by [`ArchiveReader::iter_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub key: MessageKey,
    /// Absolute timestamp, epoch microseconds.
    pub timestamp_us: u64,
    pub payload: &'a [u8],
}

/// Read-only view of one source's archive.
///
/// Onset discovery is lazy and cached; readers created by worker processes
/// should receive the onset through [`with_onset`](Self::with_onset).
pub struct ArchiveReader {
    archive: ArchiveFile,
    source_id: u8,
    keys: Vec<MessageKey>,
    has_onset_entry: bool,
    onset: OnceLock<Onset>,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let archive = ArchiveFile::open(path.as_ref())?;
        let mut keys = Vec::with_capacity(archive.len());
        let mut source_id = None;
        let mut has_onset_entry = false;
        for raw in archive.keys() {
            let key: MessageKey = raw.parse().map_err(|_| ArchiveError::Format {
                path: archive.path().to_path_buf(),
                reason: format!("foreign key {raw:?}"),
            })?;
            if *source_id.get_or_insert(key.source_id) != key.source_id {
                return Err(ArchiveError::Format {
                    path: archive.path().to_path_buf(),
                    reason: "entries of more than one source".to_string(),
                });
            }
            if key.is_onset() {
                has_onset_entry = true;
            } else {
                keys.push(key);
            }
        }
        if !keys.is_sorted() {
            return Err(ArchiveError::Format {
                path: archive.path().to_path_buf(),
                reason: "message keys out of order".to_string(),
            });
        }

        let source_id = source_id.unwrap_or_else(|| source_from_file_name(archive.path()));
        debug!(path = %archive.path().display(), source_id, messages = keys.len(), "archive opened");
        Ok(Self {
            archive,
            source_id,
            keys,
            has_onset_entry,
            onset: OnceLock::new(),
        })
    }

    /// Open with an onset discovered elsewhere; skips discovery entirely.
    pub fn with_onset(path: impl AsRef<Path>, onset_us: u64) -> ArchiveResult<Self> {
        let reader = Self::open(path)?;
        let _ = reader.onset.set(Onset {
            timestamp_us: onset_us,
            source: OnsetSource::Provided,
        });
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    /// The onset, discovering it on first use.
    ///
    /// # Errors
    ///
    /// `Format` if the onset entry exists but is not 8 bytes.
    pub fn onset(&self) -> ArchiveResult<Onset> {
        if let Some(onset) = self.onset.get() {
            return Ok(*onset);
        }
        let discovered = self.discover_onset()?;
        Ok(*self.onset.get_or_init(|| discovered))
    }

    pub fn onset_timestamp_us(&self) -> ArchiveResult<u64> {
        Ok(self.onset()?.timestamp_us)
    }

    fn discover_onset(&self) -> ArchiveResult<Onset> {
        if self.has_onset_entry {
            let key = MessageKey::onset(self.source_id).to_string();
            let timestamp_us = self
                .archive
                .get(&key)
                .and_then(decode_onset)
                .ok_or_else(|| ArchiveError::Format {
                    path: self.path().to_path_buf(),
                    reason: format!("onset entry {key} is not 8 bytes"),
                })?;
            return Ok(Onset {
                timestamp_us,
                source: OnsetSource::Recorded,
            });
        }

        let timestamp_us = self.keys.first().map_or(0, |key| key.elapsed_us);
        warn!(
            path = %self.path().display(),
            fallback_us = timestamp_us,
            "archive has no onset entry, falling back to the first message"
        );
        Ok(Onset {
            timestamp_us,
            source: OnsetSource::FirstMessage,
        })
    }

    /// Message keys in ascending order, onset excluded.
    pub fn message_keys(&self) -> &[MessageKey] {
        &self.keys
    }

    /// Messages in the archive, onset excluded.
    pub fn message_count(&self) -> usize {
        self.keys.len()
    }

    /// Iterate messages in ascending key order, over the whole archive or
    /// over `keys`. Calling it again restarts from the beginning.
    ///
    /// Keys absent from the archive yield `MissingKey` in their position.
    pub fn iter_messages<'a>(
        &'a self,
        keys: Option<&[MessageKey]>,
    ) -> ArchiveResult<impl Iterator<Item = ArchiveResult<Message<'a>>> + use<'a>> {
        let onset = self.onset()?;
        let selected: Vec<MessageKey> = match keys {
            None => self.keys.clone(),
            Some(keys) => {
                let mut keys = keys.to_vec();
                keys.sort_unstable();
                keys
            }
        };
        Ok(selected.into_iter().map(move |key| {
            let payload = self
                .archive
                .get(&key.to_string())
                .filter(|_| !key.is_onset())
                .ok_or_else(|| ArchiveError::MissingKey { key: key.to_string() })?;
            Ok(Message {
                key,
                timestamp_us: onset.absolute(key.elapsed_us),
                payload,
            })
        }))
    }

    /// Split the sorted key set into `workers * batch_multiplier` contiguous,
    /// near-equal batches. Archives below the parallel threshold come back as
    /// a single batch; an archive without messages as no batches.
    pub fn get_batches(&self, workers: usize, batch_multiplier: usize) -> Vec<Vec<MessageKey>> {
        let n = self.keys.len();
        if n == 0 {
            return Vec::new();
        }
        if n < MIN_PARALLEL_MESSAGES {
            return vec![self.keys.clone()];
        }

        let batches = workers.max(1).saturating_mul(batch_multiplier.max(1)).min(n);
        let base = n / batches;
        let extra = n % batches;
        let mut out = Vec::with_capacity(batches);
        let mut start = 0;
        for i in 0..batches {
            let len = base + usize::from(i < extra);
            out.push(self.keys[start..start + len].to_vec());
            start += len;
        }
        out
    }

    /// Every message at once: absolute timestamps and payloads, in order.
    pub fn read_all_messages(&self) -> ArchiveResult<(Vec<u64>, Vec<Vec<u8>>)> {
        let mut timestamps = Vec::with_capacity(self.keys.len());
        let mut payloads = Vec::with_capacity(self.keys.len());
        for message in self.iter_messages(None)? {
            let message = message?;
            timestamps.push(message.timestamp_us);
            payloads.push(message.payload.to_vec());
        }
        Ok((timestamps, payloads))
    }

    /// Worker count suggested for [`get_batches`](Self::get_batches).
    pub fn default_worker_count() -> usize {
        default_worker_count_for_host()
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path())
            .field("source_id", &self.source_id)
            .field("messages", &self.keys.len())
            .field("onset", &self.onset.get())
            .finish()
    }
}

/// Source id from a `{source:03}_log.arc` file name, `0` if it has none.
fn source_from_file_name(path: &Path) -> u8 {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('_').next())
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}
