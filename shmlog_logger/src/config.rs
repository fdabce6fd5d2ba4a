//! Logger and archive assembly configuration.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "info"
//! service_name = "camera-logger"
//!
//! [logger]
//! output_directory = "/var/lib/shmlog"
//! instance_name = "camera"
//! worker_count = 8
//! socket_ingress = true
//!
//! # Or: run the workers in two `shmlog` child processes
//! # runtime = "process"
//! # process_count = 2
//!
//! [assembly]
//! verify_integrity = true
//! ```

use serde::{Deserialize, Serialize};
use shmlog_common::config::{ConfigError, SharedConfig};
use shmlog_common::consts::{
    DEFAULT_BACKLOG_WARNING, DEFAULT_POLL_INTERVAL_US, DEFAULT_RUNTIME_PROGRAM,
    DEFAULT_STARTUP_TIMEOUT_MS, DEFAULT_WATCHDOG_INTERVAL_MS, DEFAULT_WORKER_COUNT,
    LOG_DIR_SUFFIX, SESSION_FILE_NAME, SHM_MAX_NAME_LEN,
};
use shmlog_shared_memory::terminator_name;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn default_instance_name() -> String {
    "data_logger".to_string()
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_poll_interval_us() -> u64 {
    DEFAULT_POLL_INTERVAL_US
}

fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}

fn default_backlog_warning() -> usize {
    DEFAULT_BACKLOG_WARNING
}

fn default_process_count() -> usize {
    1
}

fn default_runtime_program() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_PROGRAM)
}

fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

/// Where the persistence workers of a logger run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Threads of the owning process.
    #[default]
    Thread,
    /// `process_count` child processes running `shmlog run --attach`. Items
    /// reach them over their sockets, so a crash while persisting never
    /// takes the producers down with it.
    Process,
}

/// Settings of one [`DataLogger`](crate::DataLogger) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Parent of the instance log directory.
    pub output_directory: PathBuf,

    /// Instance name; names the log directory, flag and socket.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Persistence worker threads.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Idle delay between polls of an empty queue.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,

    /// Watchdog sampling period.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Queue depth that triggers a backlog warning.
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,

    /// Replace a termination flag left behind by a dead logger of the same name.
    #[serde(default)]
    pub replace_existing: bool,

    /// `fsync` every message file before publishing it.
    #[serde(default)]
    pub sync_files: bool,

    /// Accept items from other processes over a Unix socket.
    #[serde(default)]
    pub socket_ingress: bool,

    /// Run the workers in-process or in child processes.
    #[serde(default)]
    pub runtime: RuntimeMode,

    /// Child processes in [`RuntimeMode::Process`], each with `worker_count` workers.
    #[serde(default = "default_process_count")]
    pub process_count: usize,

    /// Executable started for each runtime process.
    #[serde(default = "default_runtime_program")]
    pub runtime_program: PathBuf,

    /// Bound on a runtime process accepting connections.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

impl LoggerConfig {
    /// Defaults for everything but the output directory.
    pub fn new(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            instance_name: default_instance_name(),
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            backlog_warning: DEFAULT_BACKLOG_WARNING,
            replace_existing: false,
            sync_files: false,
            socket_ingress: false,
            runtime: RuntimeMode::Thread,
            process_count: 1,
            runtime_program: default_runtime_program(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
        }
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Run the workers in `processes` child processes started from `program`.
    pub fn with_runtime_processes(mut self, program: impl Into<PathBuf>, processes: usize) -> Self {
        self.runtime = RuntimeMode::Process;
        self.runtime_program = program.into();
        self.process_count = processes;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the instance name is empty,
    /// contains `/`, or makes the flag name too long, if a count or interval
    /// is zero, or if several processes are requested in thread mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.instance_name.is_empty() {
            return fail("instance_name cannot be empty".to_string());
        }
        if self.instance_name.contains(['/', '\0']) {
            return fail(format!(
                "instance_name {:?} must not contain '/'",
                self.instance_name
            ));
        }
        if terminator_name(&self.instance_name).len() > SHM_MAX_NAME_LEN {
            return fail("instance_name is too long".to_string());
        }
        if self.worker_count == 0 {
            return fail("worker_count must be at least 1".to_string());
        }
        if self.poll_interval_us == 0 {
            return fail("poll_interval_us must be positive".to_string());
        }
        if self.watchdog_interval_ms == 0 {
            return fail("watchdog_interval_ms must be positive".to_string());
        }
        if self.process_count == 0 {
            return fail("process_count must be at least 1".to_string());
        }
        if self.process_count > 1 && self.runtime == RuntimeMode::Thread {
            return fail(format!(
                "process_count = {} needs runtime = \"process\"",
                self.process_count
            ));
        }
        if self.runtime == RuntimeMode::Process && self.runtime_program.as_os_str().is_empty() {
            return fail("runtime_program cannot be empty".to_string());
        }
        Ok(())
    }

    /// `<output_directory>/<instance_name>_data_log`
    pub fn log_directory(&self) -> PathBuf {
        self.output_directory
            .join(format!("{}{LOG_DIR_SUFFIX}", self.instance_name))
    }

    /// `<log_directory>/<instance_name>.sock`
    pub fn socket_path(&self) -> PathBuf {
        self.log_directory()
            .join(format!("{}.sock", self.instance_name))
    }

    /// `<log_directory>/<instance_name>.<index>.sock`, the ingress of
    /// runtime process `index`.
    pub fn runtime_socket_path(&self, index: usize) -> PathBuf {
        self.log_directory()
            .join(format!("{}.{index}.sock", self.instance_name))
    }

    /// `<log_directory>/<instance_name>.runtime.toml`, handed to runtime processes.
    pub fn runtime_config_path(&self) -> PathBuf {
        self.log_directory()
            .join(format!("{}.runtime.toml", self.instance_name))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Name of the termination flag buffer.
    pub fn terminator_name(&self) -> String {
        terminator_name(&self.instance_name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Options of one archive assembly run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    /// Sources assembled concurrently; `None` leaves two cores free.
    pub max_workers: Option<usize>,

    /// Delete per-message files after a successful assembly.
    pub remove_sources: bool,

    /// Memory-map message files instead of reading them into memory.
    pub memory_mapping: bool,

    /// Re-read the written archive and compare it with the sources.
    pub verify_integrity: bool,

    /// Log one line per assembled source at info level.
    pub verbose: bool,

    /// Onset override in epoch microseconds.
    pub onset_us: Option<u64>,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            remove_sources: true,
            memory_mapping: true,
            verify_integrity: false,
            verbose: false,
            onset_us: None,
        }
    }
}

impl AssemblyOptions {
    /// Worker count to use, never below one.
    pub fn resolve_workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(default_worker_count_for_host)
            .max(1)
    }
}

/// Available parallelism minus two, at least one.
pub fn default_worker_count_for_host() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(1)
        .max(1)
}

/// Full configuration file of the `shmlog` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmlogConfig {
    pub shared: SharedConfig,
    pub logger: LoggerConfig,
    #[serde(default)]
    pub assembly: AssemblyOptions,
}

impl ShmlogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.logger.validate()
    }
}

/// Session record written next to the message files on first start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub instance_name: String,
    /// Wall clock at first start, epoch microseconds.
    pub onset_us: u64,
    pub pid: u32,
    pub version: String,
}

impl SessionInfo {
    pub fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            onset_us: now_epoch_us(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn path(log_dir: &Path) -> PathBuf {
        log_dir.join(SESSION_FILE_NAME)
    }

    /// Read the session record of `log_dir`, if present and readable.
    pub fn load(log_dir: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(Self::path(log_dir)).ok()?;
        match toml::from_str(&text) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(dir = %log_dir.display(), error = %e, "ignoring unreadable session file");
                None
            }
        }
    }

    /// Write the record unless one already exists. Returns the record in effect.
    pub fn ensure(log_dir: &Path, instance_name: &str) -> std::io::Result<Self> {
        if let Some(existing) = Self::load(log_dir) {
            return Ok(existing);
        }
        let info = Self::new(instance_name);
        let text = toml::to_string(&info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(Self::path(log_dir), text)?;
        Ok(info)
    }
}

/// Current wall clock in epoch microseconds.
pub fn now_epoch_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmlog_common::config::ConfigLoader;
    use tempfile::TempDir;

    #[test]
    fn test_logger_defaults_from_toml() {
        let config: LoggerConfig = toml::from_str("output_directory = \"/tmp/out\"").unwrap();
        assert_eq!(config, LoggerConfig::new("/tmp/out"));
        assert_eq!(config.instance_name, "data_logger");
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.poll_interval(), Duration::from_micros(5000));
        assert_eq!(config.watchdog_interval(), Duration::from_millis(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_logger_paths() {
        let config = LoggerConfig::new("/data").with_instance_name("camera");
        assert_eq!(config.log_directory(), Path::new("/data/camera_data_log"));
        assert_eq!(
            config.socket_path(),
            Path::new("/data/camera_data_log/camera.sock")
        );
        assert_eq!(config.terminator_name(), "camera_terminator");
        assert_eq!(
            config.runtime_socket_path(1),
            Path::new("/data/camera_data_log/camera.1.sock")
        );
        assert_eq!(
            config.runtime_config_path(),
            Path::new("/data/camera_data_log/camera.runtime.toml")
        );
    }

    #[test]
    fn test_process_runtime_from_toml() {
        let config: LoggerConfig = toml::from_str(
            "output_directory = \"/data\"\nruntime = \"process\"\nprocess_count = 3",
        )
        .unwrap();
        assert_eq!(config.runtime, RuntimeMode::Process);
        assert_eq!(config.process_count, 3);
        assert_eq!(config.runtime_program, Path::new("shmlog"));
        assert!(config.validate().is_ok());

        let defaults = LoggerConfig::new("/data");
        assert_eq!(defaults.runtime, RuntimeMode::Thread);
        assert_eq!(defaults.process_count, 1);
    }

    #[test]
    fn test_logger_validation() {
        let base = LoggerConfig::new("/data");
        for bad in [
            base.clone().with_instance_name(""),
            base.clone().with_instance_name("a/b"),
            base.clone().with_instance_name("x".repeat(SHM_MAX_NAME_LEN)),
            base.clone().with_worker_count(0),
            LoggerConfig {
                process_count: 2,
                ..base.clone()
            },
            base.clone().with_runtime_processes("shmlog", 0),
            base.clone().with_runtime_processes("", 1),
        ] {
            assert!(matches!(
                bad.validate(),
                Err(ConfigError::ValidationError(_))
            ));
        }
    }

    #[test]
    fn test_assembly_defaults() {
        let options: AssemblyOptions = toml::from_str("").unwrap();
        assert_eq!(options, AssemblyOptions::default());
        assert!(options.remove_sources);
        assert!(options.memory_mapping);
        assert!(!options.verify_integrity);
        assert!(options.resolve_workers() >= 1);

        let pinned = AssemblyOptions {
            max_workers: Some(0),
            ..AssemblyOptions::default()
        };
        assert_eq!(pinned.resolve_workers(), 1);
    }

    #[test]
    fn test_full_config_file() {
        let text = r#"
[shared]
service_name = "camera-logger"

[logger]
output_directory = "/var/lib/shmlog"
instance_name = "camera"
socket_ingress = true

[assembly]
verify_integrity = true
"#;
        let config = ShmlogConfig::from_toml(text).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.logger.socket_ingress);
        assert!(config.assembly.verify_integrity);
        assert!(config.assembly.remove_sources);

        let written = toml::to_string(&config).unwrap();
        let reread = ShmlogConfig::from_toml(&written).unwrap();
        assert_eq!(reread.logger, config.logger);
        assert_eq!(reread.assembly, config.assembly);
    }

    #[test]
    fn test_session_written_once() {
        let dir = TempDir::new().unwrap();
        let first = SessionInfo::ensure(dir.path(), "camera").unwrap();
        let second = SessionInfo::ensure(dir.path(), "other").unwrap();
        assert_eq!(first, second);
        assert_eq!(SessionInfo::load(dir.path()), Some(first));
    }
}
