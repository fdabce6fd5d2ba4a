//! Workspace-wide constants.
//!
//! These constants are the single source of truth for on-disk and in-memory
//! naming. All other crates import from here.

/// Prefix of every shared buffer backing object in the OS namespace.
///
/// A buffer named `foo` lives at `/dev/shm/shmlog_foo` on Linux.
pub const SHM_PREFIX: &str = "shmlog_";

/// Directory holding POSIX shared memory objects on Linux.
pub const SHM_DIR: &str = "/dev/shm";

/// Longest accepted shared buffer name in bytes.
pub const SHM_MAX_NAME_LEN: usize = 200;

/// CPU cache line size in bytes. Shared headers are aligned to it.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default bound on cross-process lock acquisition, in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;

/// Extension of a single persisted log message.
pub const MESSAGE_EXTENSION: &str = "msg";

/// Extension of an assembled per-source archive.
pub const ARCHIVE_EXTENSION: &str = "arc";

/// Suffix appended to files that are still being written.
pub const PARTIAL_SUFFIX: &str = "partial";

/// File in a log directory recording the logging session onset.
pub const SESSION_FILE_NAME: &str = "session.toml";

/// Suffix of the termination flag buffer owned by a logger instance.
pub const TERMINATOR_SUFFIX: &str = "_terminator";

/// Suffix of the directory a logger instance writes into.
pub const LOG_DIR_SUFFIX: &str = "_data_log";

/// Default number of persistence workers per logger.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default idle delay between ingress polls, in microseconds.
pub const DEFAULT_POLL_INTERVAL_US: u64 = 5_000;

/// Default watchdog sampling period, in milliseconds.
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 20;

/// Queue depth above which the watchdog reports a backlog.
pub const DEFAULT_BACKLOG_WARNING: usize = 10_000;

/// Default bound on a runtime process becoming ready, in milliseconds.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;

/// How long `stop()` retries writing the stop request, in milliseconds.
pub const STOP_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default program launched for process-backed logger runtimes.
pub const DEFAULT_RUNTIME_PROGRAM: &str = "shmlog";

/// Archives with fewer messages than this are read as a single batch.
pub const MIN_PARALLEL_MESSAGES: usize = 2_000;
