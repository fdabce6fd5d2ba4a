//! Cross-process termination flag
//!
//! A one-element `u8` buffer used as a mailbox between the process that owns
//! a logger and the logger runtime. The owner requests a stop; the runtime
//! confirms with `DRAINED` once everything queued before the request has
//! been persisted.

use crate::buffer::{BufferSpec, SharedBuffer};
use crate::error::{ShmError, ShmResult};
use shmlog_common::consts::TERMINATOR_SUFFIX;
use tracing::debug;

/// State stored in the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlagState {
    /// Normal operation.
    Running = 0,
    /// Owner asked the consumer to drain and stop.
    StopRequested = 1,
    /// Consumer persisted everything and is exiting.
    Drained = 2,
}

impl FlagState {
    /// Convert from the raw byte. Returns `None` for unknown values.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Running),
            1 => Some(Self::StopRequested),
            2 => Some(Self::Drained),
            _ => None,
        }
    }
}

/// Name of the termination flag owned by logger `instance`.
pub fn terminator_name(instance: &str) -> String {
    format!("{instance}{TERMINATOR_SUFFIX}")
}

/// Shared `u8[1]` termination flag.
#[derive(Debug)]
pub struct TerminationFlag {
    buffer: SharedBuffer<u8>,
}

impl TerminationFlag {
    fn spec(name: &str) -> BufferSpec {
        BufferSpec::of::<u8>(name, vec![1])
    }

    /// Create the flag in the `Running` state.
    pub fn create(name: &str, replace: bool) -> ShmResult<Self> {
        let buffer = SharedBuffer::create_from(&Self::spec(name), &[FlagState::Running as u8], replace)?;
        Ok(Self { buffer })
    }

    /// Attach to an existing flag.
    pub fn connect(name: &str) -> ShmResult<Self> {
        Ok(Self {
            buffer: SharedBuffer::connect(&Self::spec(name))?,
        })
    }

    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    /// Current state.
    pub fn state(&self) -> ShmResult<FlagState> {
        let raw = self.buffer.get(0, true)?;
        FlagState::from_u8(raw).ok_or_else(|| ShmError::LayoutMismatch {
            name: self.name().to_string(),
            expected: "termination flag state 0..=2".to_string(),
            found: format!("byte {raw}"),
        })
    }

    /// Ask the consumer to drain and stop. Leaves a `Drained` flag untouched.
    pub fn request_stop(&self) -> ShmResult<()> {
        self.buffer.with_exclusive(|data| {
            if data[0] == FlagState::Running as u8 {
                data[0] = FlagState::StopRequested as u8;
            }
        })?;
        debug!(flag = %self.name(), "stop requested");
        Ok(())
    }

    /// True once a stop was requested, including after the drain finished.
    pub fn is_stop_requested(&self) -> ShmResult<bool> {
        Ok(self.state()? != FlagState::Running)
    }

    /// Confirm that the consumer has drained everything.
    pub fn mark_drained(&self) -> ShmResult<()> {
        self.buffer.set(0, FlagState::Drained as u8, true)?;
        debug!(flag = %self.name(), "marked drained");
        Ok(())
    }

    pub fn is_drained(&self) -> ShmResult<bool> {
        Ok(self.state()? == FlagState::Drained)
    }

    /// Return to `Running` so the flag can be reused by a new session.
    pub fn reset(&self) -> ShmResult<()> {
        self.buffer.set(0, FlagState::Running as u8, true)
    }

    /// Whether the process that created the flag is still running.
    pub fn owner_alive(&self) -> ShmResult<bool> {
        self.buffer.creator_alive()
    }

    /// Remove the flag region. Safe to call twice.
    pub fn destroy(&mut self) -> ShmResult<()> {
        self.buffer.destroy()
    }
}
