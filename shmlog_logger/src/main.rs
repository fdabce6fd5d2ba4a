//! # shmlog
//!
//! Runs a logger instance, stops one by name, assembles archives and
//! inspects them.
//!
//! # Usage
//!
//! ```bash
//! # Run a logger until Ctrl+C or `shmlog stop`
//! shmlog run --config logger.toml
//!
//! # With `runtime = "process"` the logger starts its own runtime processes:
//! # shmlog run --config <log_dir>/<instance>.runtime.toml --attach <index>
//!
//! # Stop the logger named "camera" from another shell
//! shmlog stop --instance camera --wait
//!
//! # Merge message files into per-source archives
//! shmlog assemble /var/lib/shmlog/camera_data_log --verify
//!
//! # Summarize an archive
//! shmlog inspect /var/lib/shmlog/camera_data_log/001_log.arc --json
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use shmlog_common::config::{ConfigLoader, LogLevel};
use shmlog_common::consts::DEFAULT_RUNTIME_PROGRAM;
use shmlog_common::logging::init_tracing;
use shmlog_logger::{
    ArchiveReader, AssemblyOptions, AssemblyReport, DataLogger, Onset, RuntimeMode, ShmlogConfig,
    assemble_log_archives, run_attached,
};
use shmlog_shared_memory::{ShmError, TerminationFlag, terminator_name};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// shmlog - crash-safe multi-producer logger
#[derive(Parser, Debug)]
#[command(name = "shmlog")]
#[command(version)]
#[command(about = "Crash-safe multi-producer logger with per-source archives")]
#[command(long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a logger until Ctrl+C or until its termination flag is set
    Run {
        /// Configuration file ([shared], [logger], optional [assembly])
        #[arg(short, long, default_value = "/etc/shmlog/logger.toml")]
        config: PathBuf,

        /// Replace a termination flag left behind by a dead logger
        #[arg(long)]
        replace: bool,

        /// Assemble archives after the logger stops
        #[arg(long)]
        assemble: bool,

        /// Run as runtime process INDEX of the logger that owns the
        /// termination flag (started by that logger)
        #[arg(long, value_name = "INDEX", conflicts_with_all = ["replace", "assemble"])]
        attach: Option<usize>,
    },

    /// Ask a running logger to drain and stop
    Stop {
        /// Instance name of the logger
        #[arg(short, long)]
        instance: String,

        /// Block until the logger confirms the drain
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Merge message files into one archive per source
    Assemble {
        /// Log directory holding the message files
        log_dir: PathBuf,

        /// Sources assembled concurrently (default: cores - 2)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Keep message files after assembly
        #[arg(long)]
        keep_sources: bool,

        /// Read files into memory instead of mapping them
        #[arg(long)]
        no_mmap: bool,

        /// Compare every archived entry with its source before publishing
        #[arg(long)]
        verify: bool,

        /// Onset override, epoch microseconds
        #[arg(long)]
        onset_us: Option<u64>,
    },

    /// Print a summary of an archive
    Inspect {
        /// Archive file
        archive: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("shmlog failed: {}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let default_level = if args.verbose { LogLevel::Debug } else { LogLevel::Info };

    match args.command {
        Command::Run {
            config,
            replace,
            assemble,
            attach,
        } => {
            let mut config = ShmlogConfig::load(&config)?;
            config.validate()?;
            let level = if args.verbose { LogLevel::Debug } else { config.shared.log_level };
            init_tracing(level, args.log_json);
            if let Some(index) = attach {
                return run_runtime_process(&config, index);
            }
            config.logger.replace_existing |= replace;
            run_logger(config, assemble)
        }
        Command::Stop {
            instance,
            wait,
            timeout_secs,
        } => {
            init_tracing(default_level, args.log_json);
            stop_logger(&instance, wait, Duration::from_secs(timeout_secs))
        }
        Command::Assemble {
            log_dir,
            workers,
            keep_sources,
            no_mmap,
            verify,
            onset_us,
        } => {
            init_tracing(default_level, args.log_json);
            let options = AssemblyOptions {
                max_workers: workers,
                remove_sources: !keep_sources,
                memory_mapping: !no_mmap,
                verify_integrity: verify,
                verbose: args.verbose,
                onset_us,
            };
            assemble(&log_dir, &options)
        }
        Command::Inspect { archive, json } => {
            init_tracing(default_level, args.log_json);
            inspect(archive, json)
        }
    }
}

fn run_logger(mut config: ShmlogConfig, assemble_after: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "shmlog v{} starting instance '{}' ({})",
        env!("CARGO_PKG_VERSION"),
        config.logger.instance_name,
        config.shared.service_name
    );

    // Runtime processes run this very binary unless another one is configured.
    if config.logger.runtime == RuntimeMode::Process
        && config.logger.runtime_program == Path::new(DEFAULT_RUNTIME_PROGRAM)
    {
        match std::env::current_exe() {
            Ok(exe) => config.logger.runtime_program = exe,
            Err(e) => warn!("Cannot resolve own executable, using '{}' from PATH: {}", DEFAULT_RUNTIME_PROGRAM, e),
        }
    }

    let mut logger = DataLogger::new(config.logger.clone())?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handler_flag.store(false, Ordering::SeqCst);
    })?;

    logger.start()?;
    if config.logger.socket_ingress {
        info!("Producers may connect to {}", config.logger.socket_path().display());
    }

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && logger.is_alive() {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(10) {
            let health = logger.health();
            debug!(
                queue_depth = health.queue_depth,
                persisted = health.persisted,
                forwarded = health.forwarded,
                failed = health.failed,
                workers_running = health.workers_running,
                "logger health"
            );
            last_report = Instant::now();
        }
    }
    if running.load(Ordering::SeqCst) {
        info!("Logger exited on its own (termination flag set externally or crash)");
    }

    logger.stop()?;

    if assemble_after {
        print_report(logger.assemble_archives(&config.assembly)?)?;
    }
    Ok(())
}

fn run_runtime_process(config: &ShmlogConfig, index: usize) -> Result<(), Box<dyn std::error::Error>> {
    // Ctrl+C reaches the whole process group; the owning logger drives the stop.
    ctrlc::set_handler(move || debug!("Runtime process {} ignoring interrupt", index))?;
    run_attached(&config.logger, index)?;
    Ok(())
}

fn stop_logger(instance: &str, wait: bool, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let flag = TerminationFlag::connect(&terminator_name(instance))?;
    flag.request_stop()?;
    info!("Stop requested for logger '{}'", instance);
    if !wait {
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    loop {
        match flag.is_drained() {
            Ok(true) | Err(ShmError::UseAfterDestroy { .. }) => {
                info!("Logger '{}' drained", instance);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Err(format!("logger '{instance}' did not drain within {timeout:?}").into());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn assemble(log_dir: &Path, options: &AssemblyOptions) -> Result<(), Box<dyn std::error::Error>> {
    print_report(assemble_log_archives(log_dir, options)?)
}

fn print_report(report: AssemblyReport) -> Result<(), Box<dyn std::error::Error>> {
    for archive in &report.archives {
        println!(
            "{:03}  {:>10} messages  {}",
            archive.source_id,
            archive.message_count,
            archive.path.display()
        );
    }
    for (source_id, e) in &report.failures {
        warn!("Source {:03} not assembled: {}", source_id, e);
    }
    report.into_result()?;
    Ok(())
}

#[derive(Serialize)]
struct ArchiveSummary {
    path: PathBuf,
    source_id: u8,
    message_count: usize,
    onset: Onset,
    first_timestamp_us: Option<u64>,
    last_timestamp_us: Option<u64>,
    payload_bytes: u64,
}

fn inspect(path: PathBuf, as_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let reader = ArchiveReader::open(&path)?;
    let onset = reader.onset()?;
    let mut payload_bytes = 0u64;
    let mut first = None;
    let mut last = None;
    for message in reader.iter_messages(None)? {
        let message = message?;
        payload_bytes += message.payload.len() as u64;
        if first.is_none() {
            first = Some(message.timestamp_us);
        }
        last = Some(message.timestamp_us);
    }

    let summary = ArchiveSummary {
        path,
        source_id: reader.source_id(),
        message_count: reader.message_count(),
        onset,
        first_timestamp_us: first,
        last_timestamp_us: last,
        payload_bytes,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("archive:   {}", summary.path.display());
        println!("source:    {:03}", summary.source_id);
        println!("messages:  {}", summary.message_count);
        println!("onset:     {} us ({:?})", onset.timestamp_us, onset.source);
        if let (Some(first), Some(last)) = (first, last) {
            println!("span:      {first} .. {last} us");
        }
        println!("payload:   {} bytes", summary.payload_bytes);
    }
    Ok(())
}
