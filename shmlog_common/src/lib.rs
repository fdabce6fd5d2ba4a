//! shmlog Common Library
//!
//! This crate provides shared constants, configuration loading utilities and
//! tracing setup for all shmlog workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Naming prefixes, file extensions and runtime defaults
//! - [`config`] - Configuration loading traits and types
//! - [`logging`] - `tracing` subscriber installation
//!
//! # Usage
//!
//! ```rust
//! use shmlog_common::consts::SHM_PREFIX;
//! use shmlog_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod logging;
