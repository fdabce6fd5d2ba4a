//! Tracing subscriber setup shared by the shmlog binaries and tests.

use crate::config::LogLevel;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Install a global `tracing` subscriber.
///
/// `level` applies only when `RUST_LOG` is unset or empty. Thread ids and line
/// numbers are always included since the logger runs many worker threads.
/// Calling this more than once keeps the first subscriber.
pub fn init_tracing(level: LogLevel, json: bool) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let filter = env_filter(level, &directives);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Filter from `RUST_LOG`-style `directives`, falling back to `level`.
/// Invalid directives are skipped.
fn env_filter(level: LogLevel, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level.as_tracing_level()).into())
        .parse_lossy(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_directives_override_level() {
        assert_eq!(env_filter(LogLevel::Debug, "warn").to_string(), "warn");
        let mixed = env_filter(LogLevel::Trace, "error,shmlog_logger=debug").to_string();
        assert!(mixed.contains("shmlog_logger=debug"));
        assert!(!mixed.contains("trace"));
    }

    #[test]
    fn test_level_used_without_directives() {
        assert_eq!(env_filter(LogLevel::Debug, "").to_string(), "debug");
        assert_eq!(env_filter(LogLevel::Warn, "").to_string(), "warn");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(LogLevel::Debug, false);
        init_tracing(LogLevel::Info, true);
        tracing::info!("subscriber installed");
    }
}
