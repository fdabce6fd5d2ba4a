//! Log items, message keys and their on-disk and on-wire encodings.

use crate::error::{LoggerError, LoggerResult};
use serde::{Deserialize, Serialize};
use shmlog_common::consts::MESSAGE_EXTENSION;
use std::fmt;
use std::str::FromStr;

/// Bytes in a socket frame header: source (1), timestamp (8), length (4).
pub const FRAME_HEADER_LEN: usize = 13;

/// Largest payload accepted from a socket frame.
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024 * 1024;

/// Payload length of an onset record (little-endian epoch microseconds).
pub const ONSET_PAYLOAD_LEN: usize = 8;

/// One unit submitted for logging.
///
/// `timestamp_us` is elapsed microseconds since the session onset and is
/// expected to increase per source; the pipeline does not enforce it.
/// Timestamp `0` is reserved for the onset record of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub source_id: u8,
    pub timestamp_us: u64,
    pub payload: Vec<u8>,
}

impl LogItem {
    pub fn new(source_id: u8, timestamp_us: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source_id,
            timestamp_us,
            payload: payload.into(),
        }
    }

    /// Onset record for `source_id`: absolute epoch microseconds of elapsed zero.
    pub fn onset(source_id: u8, onset_epoch_us: u64) -> Self {
        Self::new(source_id, 0, onset_epoch_us.to_le_bytes().to_vec())
    }

    pub fn is_onset(&self) -> bool {
        self.timestamp_us == 0
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.source_id, self.timestamp_us)
    }

    /// Reject items that would produce an unreadable onset record.
    pub fn validate(&self) -> LoggerResult<()> {
        if self.is_onset() && self.payload.len() != ONSET_PAYLOAD_LEN {
            return Err(LoggerError::InvalidItem {
                reason: format!(
                    "onset item for source {} must carry {ONSET_PAYLOAD_LEN} bytes, got {}",
                    self.source_id,
                    self.payload.len()
                ),
            });
        }
        Ok(())
    }
}

/// Identity of one message: source and elapsed time.
///
/// Renders as `{source:03}_{elapsed:020}`, so lexical order equals
/// chronological order within a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub source_id: u8,
    pub elapsed_us: u64,
}

impl MessageKey {
    pub const fn new(source_id: u8, elapsed_us: u64) -> Self {
        Self {
            source_id,
            elapsed_us,
        }
    }

    /// Key of the onset record of `source_id`.
    pub const fn onset(source_id: u8) -> Self {
        Self::new(source_id, 0)
    }

    pub const fn is_onset(&self) -> bool {
        self.elapsed_us == 0
    }

    /// Per-message file name, e.g. `001_00000000000000000100.msg`.
    pub fn file_name(&self) -> String {
        format!("{self}.{MESSAGE_EXTENSION}")
    }

    /// Parse a per-message file name. Returns `None` for anything else,
    /// including partial files.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(MESSAGE_EXTENSION)?.strip_suffix('.')?;
        stem.parse().ok()
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}_{:020}", self.source_id, self.elapsed_us)
    }
}

/// Error parsing a [`MessageKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message key {0:?}")]
pub struct ParseKeyError(pub String);

impl FromStr for MessageKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseKeyError(s.to_string());
        let (source, elapsed) = s.split_once('_').ok_or_else(invalid)?;
        // Only the zero-padded form sorts lexically in time order.
        let digits = |part: &str, width: usize| {
            part.len() == width && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(source, 3) || !digits(elapsed, 20) {
            return Err(invalid());
        }
        Ok(Self {
            source_id: source.parse().map_err(|_| invalid())?,
            elapsed_us: elapsed.parse().map_err(|_| invalid())?,
        })
    }
}

/// Encode `item` as one socket frame.
pub fn encode_frame(item: &LogItem) -> LoggerResult<Vec<u8>> {
    if item.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(LoggerError::InvalidItem {
            reason: format!(
                "payload of {} bytes exceeds the {MAX_FRAME_PAYLOAD} byte frame limit",
                item.payload.len()
            ),
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + item.payload.len());
    frame.push(item.source_id);
    frame.extend_from_slice(&item.timestamp_us.to_le_bytes());
    frame.extend_from_slice(&(item.payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&item.payload);
    Ok(frame)
}

/// Incremental decoder for a stream of socket frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes of an incomplete frame still buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_item(&mut self) -> LoggerResult<Option<LogItem>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let source_id = self.buf[0];
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.buf[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.buf[9..13]);
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(LoggerError::InvalidItem {
                reason: format!("frame announces {len} payload bytes"),
            });
        }
        let end = FRAME_HEADER_LEN + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_LEN..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(LogItem {
            source_id,
            timestamp_us: u64::from_le_bytes(ts),
            payload,
        }))
    }
}
