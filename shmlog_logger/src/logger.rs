//! The logger runtime and its owner-facing handle.
//!
//! ```text
//! producers ──submit──▶ IngressChannel ◀──frames── SocketIngress ◀── RemoteProducer
//!                             │
//!              ┌──────────────┼──────────────┐
//!           worker 0       worker 1   …   worker N-1 ──▶ <log_dir>/*.msg
//!              └──── watched by the watchdog ┘
//! ```
//!
//! Every runtime thread runs inside one supervisor thread (`shmlog-logger`).
//! Shutdown goes through the shared termination flag: `stop()` writes
//! `StopRequested`, the workers drain the channel and exit, the supervisor
//! writes `Drained` and returns. `stop()` also raises an in-process stop
//! signal, so a flag that stays locked delays the flag write but never the
//! drain.
//!
//! In [`RuntimeMode::Process`] the workers are replaced by one forwarder per
//! runtime process (see [`crate::process`]).

use crate::archive::{AssemblyReport, assemble_log_archives};
use crate::channel::{IngressChannel, LogProducer};
use crate::config::{AssemblyOptions, LoggerConfig, RuntimeMode, SessionInfo};
use crate::error::{ArchiveResult, LoggerError, LoggerResult};
use crate::ingress::{RemoteProducer, SocketIngress};
use crate::item::LogItem;
use crate::process::{RuntimeProcesses, run_forwarder};
use crate::sink::{FileSink, MessageSink};
use crate::watchdog::run_watchdog;
use crate::worker::{WorkerSlot, WorkerState, run_worker};
use serde::Serialize;
use shmlog_common::consts::STOP_REQUEST_TIMEOUT_MS;
use shmlog_shared_memory::{ShmError, ShmResult, TerminationFlag};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Counters shared by every runtime thread.
#[derive(Debug, Default)]
pub(crate) struct RuntimeStats {
    persisted: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    peak_queue_depth: AtomicUsize,
    watchdog_ticks: AtomicU64,
    backlog_warnings: AtomicU64,
}

impl RuntimeStats {
    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sample(&self, depth: usize) {
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
        self.watchdog_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backlog_warning(&self) {
        self.backlog_warnings.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between the owner handle and the runtime threads.
pub(crate) struct RuntimeShared {
    pub(crate) channel: Arc<IngressChannel>,
    pub(crate) sink: Arc<dyn MessageSink>,
    pub(crate) stats: RuntimeStats,
    pub(crate) workers: Vec<WorkerSlot>,
    crashed: AtomicBool,
    ingress_open: AtomicBool,
    finished: AtomicBool,
    local_stop: AtomicBool,
    pub(crate) poll_interval: Duration,
    pub(crate) watchdog_interval: Duration,
    pub(crate) backlog_warning: usize,
}

impl RuntimeShared {
    /// `threads` is the number of persisting threads: workers, or
    /// forwarders in process mode.
    pub(crate) fn new(config: &LoggerConfig, sink: Arc<dyn MessageSink>, threads: usize) -> Self {
        Self {
            channel: Arc::new(IngressChannel::default()),
            sink,
            stats: RuntimeStats::default(),
            workers: (0..threads).map(|_| WorkerSlot::new()).collect(),
            crashed: AtomicBool::new(false),
            ingress_open: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            local_stop: AtomicBool::new(false),
            poll_interval: config.poll_interval(),
            watchdog_interval: config.watchdog_interval(),
            backlog_warning: config.backlog_warning,
        }
    }

    /// Prepare for a new session. Only called while no runtime thread exists.
    pub(crate) fn reset(&self, socket_ingress: bool) {
        self.crashed.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.local_stop.store(false, Ordering::Release);
        self.ingress_open.store(socket_ingress, Ordering::Release);
        for slot in &self.workers {
            slot.set(WorkerState::Idle);
        }
    }

    pub(crate) fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::Release);
    }

    pub(crate) fn ingress_open(&self) -> bool {
        self.ingress_open.load(Ordering::Acquire)
    }

    pub(crate) fn close_ingress(&self) {
        self.ingress_open.store(false, Ordering::Release);
    }

    /// Stop signal raised inside this process, independent of the flag.
    pub(crate) fn request_local_stop(&self) {
        self.local_stop.store(true, Ordering::Release);
    }

    /// True once a stop was signalled locally or through `flag`. A flag
    /// locked by someone else is asked again on the next poll; any other
    /// flag error counts as a stop.
    pub(crate) fn stop_requested(&self, flag: &TerminationFlag) -> bool {
        if self.local_stop.load(Ordering::Acquire) {
            return true;
        }
        match flag.is_stop_requested() {
            Ok(requested) => requested,
            Err(ShmError::LockTimeout { .. }) => false,
            Err(e) => {
                warn!(error = %e, "termination flag unreadable, draining and stopping");
                true
            }
        }
    }

    /// Nothing left to persist: stop requested, socket ingress closed and
    /// channel empty.
    pub(crate) fn drain_complete(&self, flag: &TerminationFlag) -> bool {
        // Every item pushed before the stop request is visible once the request is.
        self.stop_requested(flag) && !self.ingress_open() && self.channel.is_empty()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn running_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.get() == WorkerState::Running)
            .count()
    }
}

/// Point-in-time view of a logger, serializable for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggerHealth {
    pub alive: bool,
    pub started: bool,
    pub queue_depth: usize,
    pub submitted: u64,
    pub persisted: u64,
    /// Items handed to runtime processes.
    pub forwarded: u64,
    pub failed: u64,
    pub peak_queue_depth: usize,
    pub watchdog_ticks: u64,
    pub backlog_warnings: u64,
    pub workers_running: usize,
    pub workers: Vec<WorkerState>,
    pub runtime: RuntimeMode,
}

/// Owner handle of one logger instance.
///
/// # Example
///
/// ```no_run
/// use shmlog_logger::{DataLogger, LogItem, LoggerConfig};
///
/// let mut logger = DataLogger::new(LoggerConfig::new("/tmp/shmlog"))?;
/// logger.start()?;
/// logger.submit(LogItem::new(1, 100, vec![1, 2, 3]))?;
/// logger.stop()?;
/// # Ok::<(), shmlog_logger::LoggerError>(())
/// ```
pub struct DataLogger {
    config: LoggerConfig,
    log_dir: PathBuf,
    shared: Arc<RuntimeShared>,
    flag: Option<TerminationFlag>,
    runtime: Option<Runtime>,
}

/// A running session: the supervisor thread, plus the child processes in
/// process mode.
struct Runtime {
    thread: JoinHandle<LoggerResult<()>>,
    processes: Option<RuntimeProcesses>,
}

impl DataLogger {
    /// Validate `config` and create the log directory. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: LoggerConfig) -> LoggerResult<Self> {
        let sink = Arc::new(FileSink::new(config.log_directory(), config.sync_files));
        Self::with_sink(config, sink)
    }

    pub(crate) fn with_sink(config: LoggerConfig, sink: Arc<dyn MessageSink>) -> LoggerResult<Self> {
        config.validate()?;
        let log_dir = config.log_directory();
        std::fs::create_dir_all(&log_dir)?;
        let threads = match config.runtime {
            RuntimeMode::Thread => config.worker_count,
            RuntimeMode::Process => config.process_count,
        };
        let shared = Arc::new(RuntimeShared::new(&config, sink, threads));
        Ok(Self {
            config,
            log_dir,
            shared,
            flag: None,
            runtime: None,
        })
    }

    /// Launch the runtime. A no-op while it is already running.
    pub fn start(&mut self) -> LoggerResult<()> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let session = SessionInfo::ensure(&self.log_dir, &self.config.instance_name)?;
        let flag_name = self.config.terminator_name();
        let mut flag = TerminationFlag::create(&flag_name, self.config.replace_existing)?;
        let runtime = match self.spawn_runtime(&flag_name) {
            Ok(runtime) => runtime,
            Err(e) => {
                if let Err(destroy_err) = flag.destroy() {
                    warn!(error = %destroy_err, "failed to remove termination flag");
                }
                return Err(e);
            }
        };

        info!(
            instance = %self.config.instance_name,
            dir = %self.log_dir.display(),
            workers = self.config.worker_count,
            processes = self.runtime_processes(),
            onset_us = session.onset_us,
            queue_depth = self.shared.channel.len(),
            "logger started"
        );
        self.flag = Some(flag);
        self.runtime = Some(runtime);
        Ok(())
    }

    fn runtime_processes(&self) -> usize {
        match self.config.runtime {
            RuntimeMode::Thread => 0,
            RuntimeMode::Process => self.config.process_count,
        }
    }

    fn spawn_runtime(&self, flag_name: &str) -> LoggerResult<Runtime> {
        let runtime_flag = TerminationFlag::connect(flag_name)?;
        let ingress = if self.config.socket_ingress {
            Some(SocketIngress::bind(&self.config.socket_path())?)
        } else {
            None
        };
        let (persistence, processes) = match self.config.runtime {
            RuntimeMode::Thread => (Persistence::Local, None),
            RuntimeMode::Process => {
                let (processes, remotes) = RuntimeProcesses::launch(&self.config)?;
                (Persistence::Remote(remotes), Some(processes))
            }
        };
        // The owner confirms the drain itself once the runtime processes exited.
        let confirm_drain = processes.is_none();

        self.shared.reset(ingress.is_some());
        let shared = Arc::clone(&self.shared);
        let name = "shmlog-logger".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || supervise(shared, runtime_flag, ingress, persistence, confirm_drain))
            .map_err(|source| LoggerError::Spawn { name, source })?;
        Ok(Runtime { thread, processes })
    }

    /// Enqueue one item. Items submitted before `start()` wait in the queue.
    pub fn submit(&self, item: LogItem) -> LoggerResult<()> {
        item.validate()?;
        self.shared.channel.push(item);
        Ok(())
    }

    /// Cloneable submit handle for other threads.
    pub fn producer(&self) -> LogProducer {
        LogProducer::new(Arc::clone(&self.shared.channel))
    }

    /// Request a stop and block until every queued item is persisted and
    /// every runtime thread has exited. A no-op when not running.
    ///
    /// # Errors
    ///
    /// `RuntimeCrashed` if a runtime thread panicked or a runtime process
    /// failed. In process mode, `Shm` if the stop request cannot be written
    /// before the retry deadline; the runtime processes are killed then. The
    /// termination flag is released in every case.
    pub fn stop(&mut self) -> LoggerResult<()> {
        let Some(Runtime { thread, processes }) = self.runtime.take() else {
            return Ok(());
        };
        info!(
            instance = %self.config.instance_name,
            queue_depth = self.shared.channel.len(),
            "stopping logger"
        );
        self.shared.request_local_stop();

        let outcome = match processes {
            None => {
                if let Err(e) = self.write_flag("stop request", TerminationFlag::request_stop) {
                    warn!(error = %e, "stop request not written, draining on the local signal");
                }
                self.join_runtime(thread)
            }
            Some(processes) => self.stop_processes(thread, processes),
        };

        if let Some(mut flag) = self.flag.take() {
            if let Err(e) = flag.destroy() {
                warn!(error = %e, "failed to remove termination flag");
            }
        }

        match &outcome {
            Ok(()) => info!(
                instance = %self.config.instance_name,
                persisted = self.shared.stats.persisted(),
                forwarded = self.shared.stats.forwarded.load(Ordering::Relaxed),
                failed = self.shared.stats.failed(),
                "logger stopped"
            ),
            Err(e) => error!(instance = %self.config.instance_name, error = %e, "logger stopped abnormally"),
        }
        outcome
    }

    fn join_runtime(&self, thread: JoinHandle<LoggerResult<()>>) -> LoggerResult<()> {
        thread.join().unwrap_or_else(|_| {
            Err(LoggerError::RuntimeCrashed {
                undrained: self.shared.channel.len(),
            })
        })
    }

    fn write_flag(&self, what: &str, write: fn(&TerminationFlag) -> ShmResult<()>) -> ShmResult<()> {
        match &self.flag {
            Some(flag) => retry_flag_write(flag, what, write),
            None => Ok(()),
        }
    }

    /// Forwarders first, so everything queued here reaches a runtime
    /// process before the processes see the stop request.
    fn stop_processes(
        &self,
        thread: JoinHandle<LoggerResult<()>>,
        processes: RuntimeProcesses,
    ) -> LoggerResult<()> {
        let forwarded = self.join_runtime(thread);
        if let Err(e) = self.write_flag("stop request", TerminationFlag::request_stop) {
            error!(error = %e, "runtime processes cannot be asked to stop, killing them");
            drop(processes);
            return Err(e.into());
        }
        let exited_cleanly = processes.wait();
        forwarded?;
        if !exited_cleanly {
            return Err(LoggerError::RuntimeCrashed {
                undrained: self.shared.channel.len(),
            });
        }
        self.write_flag("drain confirmation", TerminationFlag::mark_drained)?;
        Ok(())
    }

    /// True from `start()` until the runtime exits, normally or not. In
    /// process mode every runtime process must still be running.
    pub fn is_alive(&self) -> bool {
        self.runtime.as_ref().is_some_and(|runtime| {
            !runtime.thread.is_finished()
                && runtime
                    .processes
                    .as_ref()
                    .is_none_or(RuntimeProcesses::all_running)
        })
    }

    /// True between `start()` and `stop()`.
    pub fn is_started(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn health(&self) -> LoggerHealth {
        let stats = &self.shared.stats;
        LoggerHealth {
            alive: self.is_alive(),
            started: self.is_started(),
            queue_depth: self.shared.channel.len(),
            submitted: self.shared.channel.submitted(),
            persisted: stats.persisted(),
            forwarded: stats.forwarded.load(Ordering::Relaxed),
            failed: stats.failed(),
            peak_queue_depth: stats.peak_queue_depth.load(Ordering::Relaxed),
            watchdog_ticks: stats.watchdog_ticks.load(Ordering::Relaxed),
            backlog_warnings: stats.backlog_warnings.load(Ordering::Relaxed),
            workers_running: self.shared.running_workers(),
            workers: self.shared.workers.iter().map(WorkerSlot::get).collect(),
            runtime: self.config.runtime,
        }
    }

    /// Merge this logger's message files into one archive per source.
    ///
    /// Meant for a stopped logger. While it runs, files persisted after the
    /// directory scan wait for the next assembly.
    pub fn assemble_archives(&self, options: &AssemblyOptions) -> ArchiveResult<AssemblyReport> {
        if self.is_started() {
            warn!(
                instance = %self.config.instance_name,
                "assembling while the logger runs"
            );
        }
        assemble_log_archives(&self.log_dir, options)
    }

    pub fn log_directory(&self) -> &Path {
        &self.log_dir
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }
}

impl std::fmt::Debug for DataLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogger")
            .field("instance", &self.config.instance_name)
            .field("log_dir", &self.log_dir)
            .field("started", &self.is_started())
            .field("queue_depth", &self.shared.channel.len())
            .finish()
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "logger stop on drop failed");
        }
    }
}

fn spawn_scoped<'scope, F>(
    scope: &'scope Scope<'scope, '_>,
    shared: &RuntimeShared,
    name: String,
    f: F,
) -> LoggerResult<ScopedJoinHandle<'scope, ()>>
where
    F: FnOnce() + Send + 'scope,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn_scoped(scope, f)
        .map_err(|source| {
            // Threads already running see the crash and exit before the scope joins them.
            shared.mark_crashed();
            LoggerError::Spawn { name, source }
        })
}

/// Write `flag`, retrying lock timeouts until the stop deadline.
pub(crate) fn retry_flag_write(
    flag: &TerminationFlag,
    what: &str,
    write: fn(&TerminationFlag) -> ShmResult<()>,
) -> ShmResult<()> {
    let deadline = Instant::now() + Duration::from_millis(STOP_REQUEST_TIMEOUT_MS);
    loop {
        match write(flag) {
            Err(e @ ShmError::LockTimeout { .. }) if Instant::now() < deadline => {
                warn!(flag = %flag.name(), error = %e, "{what} blocked, retrying");
            }
            other => return other,
        }
    }
}

/// Where the items of a runtime end up.
pub(crate) enum Persistence {
    /// Worker threads write message files.
    Local,
    /// One forwarder per runtime process socket.
    Remote(Vec<RemoteProducer>),
}

/// Body of the `shmlog-logger` thread, and of the runtime thread inside a
/// runtime process. With `confirm_drain` the supervisor writes `Drained`
/// after a clean drain.
pub(crate) fn supervise(
    shared: Arc<RuntimeShared>,
    flag: TerminationFlag,
    ingress: Option<SocketIngress>,
    persistence: Persistence,
    confirm_drain: bool,
) -> LoggerResult<()> {
    let shared = &*shared;
    let flag = &flag;

    thread::scope(|scope| -> LoggerResult<()> {
        let mut handles = Vec::with_capacity(shared.workers.len() + 1);
        if let Some(ingress) = ingress {
            handles.push(spawn_scoped(scope, shared, "shmlog-ingress".into(), move || {
                ingress.run(shared, flag)
            })?);
        }
        match persistence {
            Persistence::Local => {
                for id in 0..shared.workers.len() {
                    handles.push(spawn_scoped(scope, shared, format!("shmlog-worker-{id}"), move || {
                        run_worker(id, shared, flag)
                    })?);
                }
            }
            Persistence::Remote(remotes) => {
                for (id, remote) in remotes.into_iter().enumerate() {
                    handles.push(spawn_scoped(scope, shared, format!("shmlog-forwarder-{id}"), move || {
                        run_forwarder(id, shared, flag, remote)
                    })?);
                }
            }
        }
        let watchdog = spawn_scoped(scope, shared, "shmlog-watchdog".into(), move || {
            run_watchdog(shared, flag)
        })?;

        let mut clean = true;
        for handle in handles {
            clean &= handle.join().is_ok();
        }
        let drained = if confirm_drain && clean && !shared.is_crashed() {
            retry_flag_write(flag, "drain confirmation", TerminationFlag::mark_drained).map_err(LoggerError::from)
        } else {
            Ok(())
        };
        shared.finish();
        clean &= watchdog.join().is_ok();

        if !clean || shared.is_crashed() {
            return Err(LoggerError::RuntimeCrashed {
                undrained: shared.channel.len(),
            });
        }
        drained
    })
}
