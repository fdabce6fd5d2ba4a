//! Cross-process region lock with bounded acquisition

use crate::error::{ShmError, ShmResult};
use crate::platform;
use parking_lot::{Mutex, MutexGuard};
use std::fs::File;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_micros(20);
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Two-level lock guarding one handle's view of a region.
///
/// The in-process mutex serialises threads sharing a handle, since `flock`
/// is owned by the open file description and would not exclude them. The
/// `flock` serialises distinct handles in this and other processes, and is
/// released by the kernel if the holder dies.
pub(crate) struct RegionLock {
    local: Mutex<()>,
    timeout: Duration,
}

/// Held lock. Releases `flock` first, then the local mutex.
pub(crate) struct RegionLockGuard<'a> {
    _flock: platform::FileLock,
    _local: MutexGuard<'a, ()>,
}

impl RegionLock {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            local: Mutex::new(()),
            timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire both levels, failing with `LockTimeout` after the bound.
    pub(crate) fn acquire<'a>(&'a self, file: &'a File, name: &str) -> ShmResult<RegionLockGuard<'a>> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = || ShmError::LockTimeout {
            name: name.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        };

        let local = self.local.try_lock_for(self.timeout).ok_or_else(timed_out)?;

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(flock) = platform::try_lock_exclusive(file)? {
                return Ok(RegionLockGuard {
                    _flock: flock,
                    _local: local,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(buffer = name, "lock acquisition timed out");
                return Err(timed_out());
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
