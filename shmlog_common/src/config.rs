//! TOML configuration for the shmlog binaries.
//!
//! Every shmlog application reads its settings from a TOML file through the
//! [`ConfigLoader`] blanket trait. Application configs embed [`SharedConfig`]
//! under a `[shared]` table:
//!
//! ```rust,no_run
//! # use shmlog_common::config::{ConfigError, ConfigLoader, SharedConfig};
//! # use serde::Deserialize;
//! #[derive(Deserialize)]
//! struct AssemblerConfig {
//!     shared: SharedConfig,
//!     log_dir: std::path::PathBuf,
//! }
//!
//! # fn main() -> Result<(), ConfigError> {
//! let config = AssemblerConfig::from_toml(
//!     "log_dir = \"/data/run_01\"\n[shared]\nservice_name = \"assembler\"",
//! )?;
//! config.shared.validate()?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Why a configuration could not be loaded.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("config file not found")]
    FileNotFound,

    /// Unreadable file, bad TOML or a missing field.
    #[error("invalid config: {0}")]
    ParseError(String),

    /// Parsed, but the values are unusable.
    #[error("config rejected: {0}")]
    ValidationError(String),
}

/// Minimum level for `tracing` output, written lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-item persistence and frame decoding.
    Trace,
    /// Watchdog samples and archive opens.
    Debug,
    /// Lifecycle events.
    #[default]
    Info,
    /// Backlog and recoverable faults.
    Warn,
    /// Failed items and crashed workers.
    Error,
}

impl LogLevel {
    /// Equivalent `tracing` level.
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Common configuration fields shared across all shmlog applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "camera-logger"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid or a field is missing
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from an in-memory TOML document.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can be loaded from TOML.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
