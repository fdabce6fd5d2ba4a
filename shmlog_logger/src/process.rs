//! Process-backed logger runtime.
//!
//! With `runtime = "process"` the owner keeps the ingress channel and runs one
//! forwarder thread per runtime process. Each runtime process is
//! `shmlog run --attach <index>`: it connects to the owner's termination flag,
//! listens on its own socket and persists what arrives with ordinary worker
//! threads. A crash while persisting only takes a runtime process down.
//!
//! The flag stays with the owner. Runtime processes drain when it reads
//! `StopRequested` or when the owner process is gone, and the owner writes
//! `Drained` once every runtime process exited cleanly.

use crate::config::{AssemblyOptions, LoggerConfig, RuntimeMode, ShmlogConfig};
use crate::error::{LoggerError, LoggerResult};
use crate::ingress::{RemoteProducer, SocketIngress};
use crate::logger::{Persistence, RuntimeShared, supervise};
use crate::sink::FileSink;
use crate::worker::{ExitGuard, WorkerState};
use parking_lot::Mutex;
use shmlog_common::config::{LogLevel, SharedConfig};
use shmlog_shared_memory::TerminationFlag;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const CONNECT_RETRY: Duration = Duration::from_millis(10);

struct RuntimeChild {
    index: usize,
    child: Child,
}

/// Runtime processes of one logger session. Dropping it kills the ones
/// still running.
pub(crate) struct RuntimeProcesses {
    children: Mutex<Vec<RuntimeChild>>,
    config_path: PathBuf,
}

impl RuntimeProcesses {
    /// Spawn `process_count` runtime processes and connect to each socket.
    ///
    /// # Errors
    ///
    /// `Spawn` if the program cannot be started, `ProcessStart` if a process
    /// exits or misses the startup deadline before accepting connections.
    pub(crate) fn launch(config: &LoggerConfig) -> LoggerResult<(Self, Vec<RemoteProducer>)> {
        let config_path = config.runtime_config_path();
        write_runtime_config(config, &config_path)?;
        let mut processes = Self {
            children: Mutex::new(Vec::with_capacity(config.process_count)),
            config_path,
        };

        for index in 0..config.process_count {
            remove_stale_socket(&config.runtime_socket_path(index))?;
            let child = Command::new(&config.runtime_program)
                .arg("run")
                .arg("--config")
                .arg(&processes.config_path)
                .arg("--attach")
                .arg(index.to_string())
                .stdin(Stdio::null())
                .spawn()
                .map_err(|source| LoggerError::Spawn {
                    name: format!("runtime process {index} ({})", config.runtime_program.display()),
                    source,
                })?;
            debug!(index, pid = child.id(), "runtime process spawned");
            processes.children.get_mut().push(RuntimeChild { index, child });
        }

        let deadline = Instant::now() + config.startup_timeout();
        let mut remotes = Vec::with_capacity(config.process_count);
        for index in 0..config.process_count {
            remotes.push(processes.connect(index, &config.runtime_socket_path(index), deadline)?);
        }
        info!(
            processes = config.process_count,
            program = %config.runtime_program.display(),
            "runtime processes ready"
        );
        Ok((processes, remotes))
    }

    fn connect(&self, index: usize, socket: &Path, deadline: Instant) -> LoggerResult<RemoteProducer> {
        loop {
            let e = match RemoteProducer::connect(socket) {
                Ok(remote) => return Ok(remote),
                Err(e) => e,
            };
            if let Some(status) = self.exit_status(index)? {
                return Err(LoggerError::ProcessStart {
                    index,
                    reason: format!("exited with {status} before accepting connections"),
                });
            }
            if Instant::now() >= deadline {
                return Err(LoggerError::ProcessStart {
                    index,
                    reason: format!("{} not accepting connections: {e}", socket.display()),
                });
            }
            thread::sleep(CONNECT_RETRY);
        }
    }

    fn exit_status(&self, index: usize) -> io::Result<Option<ExitStatus>> {
        let mut children = self.children.lock();
        match children.iter_mut().find(|c| c.index == index) {
            Some(c) => c.child.try_wait(),
            None => Ok(None),
        }
    }

    /// True while no runtime process has exited.
    pub(crate) fn all_running(&self) -> bool {
        self.children.lock().iter_mut().all(|c| match c.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(index = c.index, error = %e, "cannot poll runtime process");
                false
            }
        })
    }

    /// Block until every runtime process exited. True if all succeeded.
    pub(crate) fn wait(mut self) -> bool {
        let children = std::mem::take(self.children.get_mut());
        let mut clean = true;
        for RuntimeChild { index, mut child } in children {
            match child.wait() {
                Ok(status) if status.success() => debug!(index, "runtime process exited"),
                Ok(status) => {
                    error!(index, %status, "runtime process failed");
                    clean = false;
                }
                Err(e) => {
                    error!(index, error = %e, "cannot wait for runtime process");
                    clean = false;
                }
            }
        }
        clean
    }
}

impl Drop for RuntimeProcesses {
    fn drop(&mut self) {
        for RuntimeChild { index, mut child } in self.children.get_mut().drain(..) {
            if let Ok(None) = child.try_wait() {
                warn!(index, pid = child.id(), "killing runtime process");
                if let Err(e) = child.kill() {
                    warn!(index, error = %e, "failed to kill runtime process");
                }
            }
            let _ = child.wait();
        }
        match fs::remove_file(&self.config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.config_path.display(), error = %e, "failed to remove runtime config"),
        }
    }
}

/// The configuration a runtime process starts from: the owner's, run in
/// thread mode without a socket of its own.
fn write_runtime_config(config: &LoggerConfig, path: &Path) -> LoggerResult<()> {
    let runtime = ShmlogConfig {
        shared: SharedConfig {
            log_level: LogLevel::default(),
            service_name: format!("{}-runtime", config.instance_name),
        },
        logger: LoggerConfig {
            runtime: RuntimeMode::Thread,
            process_count: 1,
            socket_ingress: false,
            replace_existing: false,
            ..config.clone()
        },
        assembly: AssemblyOptions::default(),
    };
    let text = toml::to_string(&runtime).map_err(io::Error::other)?;
    fs::write(path, text)?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale runtime socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Forwarder loop: hand queued items to runtime process `id` until the
/// drain completes. A broken connection counts as a runtime crash.
pub(crate) fn run_forwarder(
    id: usize,
    shared: &RuntimeShared,
    flag: &TerminationFlag,
    mut remote: RemoteProducer,
) {
    let slot = &shared.workers[id];
    let _guard = ExitGuard::new(shared, Some(slot), "forwarder");
    slot.set(WorkerState::Running);
    debug!(process = id, "forwarder started");

    loop {
        if shared.is_crashed() {
            break;
        }
        if let Some(item) = shared.channel.pop() {
            if let Err(e) = remote.submit(&item) {
                shared.stats.record_failed();
                error!(
                    process = id,
                    source_id = item.source_id,
                    timestamp = item.timestamp_us,
                    error = %e,
                    "runtime process unreachable"
                );
                shared.mark_crashed();
                break;
            }
            shared.stats.record_forwarded();
            trace!(process = id, source_id = item.source_id, "forwarded");
            continue;
        }
        if shared.drain_complete(flag) {
            break;
        }
        thread::sleep(shared.poll_interval);
    }

    debug!(process = id, "forwarder stopped");
}

/// Body of `shmlog run --attach <index>`: persist everything that arrives on
/// the socket of runtime process `index` until the owner asks for a stop or
/// exits.
///
/// # Errors
///
/// `Shm` if the owner's termination flag does not exist, `Io` if the socket
/// cannot be bound, `RuntimeCrashed` if a worker panicked.
pub fn run_attached(config: &LoggerConfig, index: usize) -> LoggerResult<()> {
    config.validate()?;
    let sink = Arc::new(FileSink::new(config.log_directory(), config.sync_files));
    let shared = Arc::new(RuntimeShared::new(config, sink, config.worker_count));
    let runtime_flag = TerminationFlag::connect(&config.terminator_name())?;
    let owner = TerminationFlag::connect(&config.terminator_name())?;
    let ingress = SocketIngress::bind(&config.runtime_socket_path(index))?;
    shared.reset(true);

    let name = format!("shmlog-runtime-{index}");
    let runtime = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || supervise(shared, runtime_flag, Some(ingress), Persistence::Local, false))
            .map_err(|source| LoggerError::Spawn { name, source })?
    };
    info!(index, workers = config.worker_count, "runtime process attached");

    let mut owner_gone = false;
    while !runtime.is_finished() {
        thread::sleep(config.watchdog_interval());
        if !owner_gone && !owner.owner_alive().unwrap_or(false) {
            warn!(index, "owner process gone, draining");
            shared.request_local_stop();
            owner_gone = true;
        }
    }

    let outcome = runtime.join().unwrap_or_else(|_| {
        Err(LoggerError::RuntimeCrashed {
            undrained: shared.channel.len(),
        })
    });
    info!(
        index,
        persisted = shared.stats.persisted(),
        failed = shared.stats.failed(),
        "runtime process finished"
    );
    outcome
}
