//! Persistence workers and their observable state machine.

use crate::logger::RuntimeShared;
use serde::Serialize;
use shmlog_shared_memory::TerminationFlag;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error, trace};

/// Lifecycle of one worker thread: `Idle → Running → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerState {
    /// Slot allocated, thread not running yet.
    Idle = 0,
    /// Draining the ingress channel.
    Running = 1,
    /// Thread exited, normally or by unwinding.
    Stopped = 2,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Atomic state cell the watchdog reads without touching the worker.
#[derive(Debug)]
pub(crate) struct WorkerSlot(AtomicU8);

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Moves a thread's slot to `Stopped` on every exit path and turns an
/// unwinding thread into a runtime crash.
pub(crate) struct ExitGuard<'a> {
    slot: Option<&'a WorkerSlot>,
    shared: &'a RuntimeShared,
    thread: &'static str,
}

impl<'a> ExitGuard<'a> {
    pub(crate) fn new(
        shared: &'a RuntimeShared,
        slot: Option<&'a WorkerSlot>,
        thread: &'static str,
    ) -> Self {
        Self {
            slot,
            shared,
            thread,
        }
    }
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            slot.set(WorkerState::Stopped);
        }
        if std::thread::panicking() {
            error!(thread = self.thread, "logger thread panicked");
            self.shared.mark_crashed();
        }
    }
}

/// Worker loop: persist items until a stop was requested (locally or through
/// the flag), the socket ingress is closed and the channel is empty.
pub(crate) fn run_worker(id: usize, shared: &RuntimeShared, flag: &TerminationFlag) {
    let slot = &shared.workers[id];
    let _guard = ExitGuard::new(shared, Some(slot), "worker");
    slot.set(WorkerState::Running);
    debug!(worker = id, "worker started");

    loop {
        if shared.is_crashed() {
            break;
        }
        if let Some(item) = shared.channel.pop() {
            match shared.sink.persist(&item) {
                Ok(()) => {
                    shared.stats.record_persisted();
                    trace!(
                        worker = id,
                        source_id = item.source_id,
                        timestamp = item.timestamp_us,
                        "persisted"
                    );
                }
                Err(e) => {
                    shared.stats.record_failed();
                    error!(
                        worker = id,
                        source_id = item.source_id,
                        timestamp = item.timestamp_us,
                        error = %e,
                        "failed to persist log item"
                    );
                }
            }
            continue;
        }
        if shared.drain_complete(flag) {
            break;
        }
        std::thread::sleep(shared.poll_interval);
    }

    debug!(worker = id, "worker stopped");
}
