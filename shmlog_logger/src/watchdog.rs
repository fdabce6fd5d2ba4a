//! Runtime watchdog: samples queue depth and worker liveness.
//!
//! Observability only. A dead worker is reported, never restarted.

use crate::logger::RuntimeShared;
use crate::worker::{ExitGuard, WorkerState};
use shmlog_shared_memory::TerminationFlag;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const BACKLOG_WARN_PERIOD: Duration = Duration::from_secs(1);

pub(crate) fn run_watchdog(shared: &RuntimeShared, flag: &TerminationFlag) {
    let _guard = ExitGuard::new(shared, None, "watchdog");
    let mut reported = vec![false; shared.workers.len()];
    let mut last_backlog_warning: Option<Instant> = None;
    let mut stop_seen = false;

    while !shared.is_finished() && !shared.is_crashed() {
        let depth = shared.channel.len();
        shared.stats.record_sample(depth);

        if depth > shared.backlog_warning {
            let due = last_backlog_warning.is_none_or(|t| t.elapsed() >= BACKLOG_WARN_PERIOD);
            if due {
                warn!(queue_depth = depth, threshold = shared.backlog_warning, "ingress backlog growing");
                shared.stats.record_backlog_warning();
                last_backlog_warning = Some(Instant::now());
            }
        }

        if !stop_seen && shared.stop_requested(flag) {
            info!(queue_depth = depth, "stop requested, draining");
            stop_seen = true;
        }
        let stop_requested = stop_seen;

        for (id, slot) in shared.workers.iter().enumerate() {
            if slot.get() == WorkerState::Stopped && !stop_requested && !reported[id] {
                error!(worker = id, "worker exited before a stop was requested");
                reported[id] = true;
            }
        }

        debug!(
            queue_depth = depth,
            workers_running = shared.running_workers(),
            "watchdog sample"
        );
        std::thread::sleep(shared.watchdog_interval);
    }
}
