//! End-to-end tests of the logger runtime: submit, drain on stop, socket
//! ingress and the cross-process termination flag.

use shmlog_common::config::ConfigError;
use shmlog_logger::{
    ArchiveFile, ArchiveReader, AssemblyOptions, DataLogger, LogItem, LoggerConfig, LoggerError,
    OnsetSource, RemoteProducer, SessionInfo, WorkerState, assemble_log_archives,
};
use shmlog_shared_memory::{ShmError, TerminationFlag};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn config(dir: &TempDir) -> LoggerConfig {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    LoggerConfig::new(dir.path()).with_instance_name(format!("pipe_{}_{n}", std::process::id()))
}

fn message_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".msg"))
        .collect();
    names.sort();
    names
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_stop_persists_every_submitted_item() {
    for workers in [1, 3, 8] {
        let dir = TempDir::new().unwrap();
        let mut logger = DataLogger::new(config(&dir).with_worker_count(workers)).unwrap();
        logger.start().unwrap();
        for ts in 1..=500u64 {
            logger
                .submit(LogItem::new((ts % 4) as u8, ts, ts.to_le_bytes().to_vec()))
                .unwrap();
        }
        logger.stop().unwrap();

        let files = message_files(logger.log_directory());
        assert_eq!(files.len(), 500, "workers = {workers}");
        let health = logger.health();
        assert_eq!(health.persisted, 500);
        assert_eq!(health.failed, 0);
        assert_eq!(health.queue_depth, 0);
    }
}

#[test]
fn test_two_messages_to_archive() {
    let dir = TempDir::new().unwrap();
    let mut logger = DataLogger::new(config(&dir)).unwrap();
    logger.start().unwrap();
    logger.submit(LogItem::new(1, 100, vec![1, 2, 3])).unwrap();
    logger.submit(LogItem::new(1, 200, vec![4, 5, 6])).unwrap();
    logger.stop().unwrap();

    let log_dir = logger.log_directory().to_path_buf();
    assert_eq!(
        message_files(&log_dir),
        ["001_00000000000000000100.msg", "001_00000000000000000200.msg"]
    );
    assert_eq!(fs::read(log_dir.join("001_00000000000000000100.msg")).unwrap(), [1, 2, 3]);

    let report = assemble_log_archives(&log_dir, &AssemblyOptions::default()).unwrap();
    let archives = report.into_result().unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].message_count, 2);
    assert_eq!(ArchiveFile::open(&archives[0].path).unwrap().len(), 3);
    assert!(message_files(&log_dir).is_empty());

    let session = SessionInfo::load(&log_dir).unwrap();
    let reader = ArchiveReader::open(&archives[0].path).unwrap();
    assert_eq!(reader.onset_timestamp_us().unwrap(), session.onset_us);
    assert_eq!(reader.onset().unwrap().source, OnsetSource::Recorded);

    let messages: Vec<_> = reader
        .iter_messages(None)
        .unwrap()
        .map(|m| m.unwrap())
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload, [1, 2, 3]);
    assert_eq!(messages[1].payload, [4, 5, 6]);
    assert_eq!(messages[0].timestamp_us, session.onset_us + 100);
    assert_eq!(messages[1].timestamp_us, session.onset_us + 200);
}

#[test]
fn test_items_submitted_before_start_are_kept() {
    let dir = TempDir::new().unwrap();
    let mut logger = DataLogger::new(config(&dir)).unwrap();
    logger.submit(LogItem::new(2, 10, vec![1])).unwrap();
    logger.submit(LogItem::new(2, 20, vec![2])).unwrap();
    assert!(!logger.is_alive());
    assert_eq!(logger.health().queue_depth, 2);

    logger.start().unwrap();
    logger.stop().unwrap();
    assert_eq!(message_files(logger.log_directory()).len(), 2);
}

#[test]
fn test_producers_on_many_threads() {
    let dir = TempDir::new().unwrap();
    let mut logger = DataLogger::new(config(&dir).with_worker_count(4)).unwrap();
    logger.start().unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|source| {
            let producer = logger.producer();
            thread::spawn(move || {
                for ts in 1..=250u64 {
                    producer.submit(LogItem::new(source, ts, vec![source; 16])).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    logger.stop().unwrap();

    let files = message_files(logger.log_directory());
    assert_eq!(files.len(), 1000);
    for source in 0..4u8 {
        let prefix = format!("{source:03}_");
        assert_eq!(files.iter().filter(|f| f.starts_with(&prefix)).count(), 250);
    }
}

#[test]
fn test_lifecycle_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut logger = DataLogger::new(config(&dir)).unwrap();
    assert!(!logger.is_started());
    logger.stop().unwrap();

    logger.start().unwrap();
    logger.start().unwrap();
    assert!(logger.is_alive());
    assert!(logger.is_started());

    logger.stop().unwrap();
    logger.stop().unwrap();
    assert!(!logger.is_alive());
    assert!(logger.health().workers.iter().all(|s| *s == WorkerState::Stopped));
}

#[test]
fn test_external_stop_through_flag() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut logger = DataLogger::new(config.clone()).unwrap();
    logger.start().unwrap();
    for ts in 1..=50 {
        logger.submit(LogItem::new(3, ts, vec![0; 8])).unwrap();
    }

    let flag = TerminationFlag::connect(&config.terminator_name()).unwrap();
    flag.request_stop().unwrap();
    assert!(wait_until(|| !logger.is_alive()));
    assert!(flag.is_drained().unwrap());

    logger.stop().unwrap();
    assert_eq!(message_files(logger.log_directory()).len(), 50);
    assert!(matches!(flag.state(), Err(ShmError::UseAfterDestroy { .. })));
}

#[test]
fn test_socket_ingress() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.socket_ingress = true;
    let mut logger = DataLogger::new(config.clone()).unwrap();
    logger.start().unwrap();

    let mut remote = RemoteProducer::connect(config.socket_path()).unwrap();
    for ts in 1..=100u64 {
        remote
            .submit(&LogItem::new(9, ts, vec![ts as u8; (ts as usize) * 10]))
            .unwrap();
    }
    let mut second = RemoteProducer::connect(config.socket_path()).unwrap();
    second.submit(&LogItem::onset(9, 1_700_000_000_000_000)).unwrap();
    logger.submit(LogItem::new(8, 5, vec![1])).unwrap();

    logger.stop().unwrap();
    let files = message_files(logger.log_directory());
    assert_eq!(files.len(), 102);
    assert_eq!(
        fs::read(logger.log_directory().join("009_00000000000000000007.msg")).unwrap(),
        vec![7u8; 70]
    );
    assert!(!config.socket_path().exists());
}

#[test]
fn test_assemble_archives_after_stop() {
    let dir = TempDir::new().unwrap();
    let mut logger = DataLogger::new(config(&dir)).unwrap();
    logger.start().unwrap();
    logger.submit(LogItem::onset(7, 1_700_000_000_000_000)).unwrap();
    for ts in 1..=30 {
        logger.submit(LogItem::new(7, ts * 100, vec![ts as u8])).unwrap();
    }
    logger.submit(LogItem::new(8, 50, vec![0])).unwrap();
    logger.stop().unwrap();

    let report = logger.assemble_archives(&AssemblyOptions::default()).unwrap();
    let archives = report.into_result().unwrap();
    assert_eq!(archives.len(), 2);
    assert_eq!(archives[0].source_id, 7);
    assert_eq!(archives[0].message_count, 30);
    assert!(message_files(logger.log_directory()).is_empty());

    let reader = ArchiveReader::open(&archives[0].path).unwrap();
    assert_eq!(reader.message_count(), 30);
}

#[test]
fn test_instance_name_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let mut first = DataLogger::new(config.clone()).unwrap();
    first.start().unwrap();

    let mut second = DataLogger::new(config).unwrap();
    assert!(matches!(
        second.start(),
        Err(LoggerError::Shm(ShmError::Allocation { .. }))
    ));
    assert!(first.is_alive());
    first.stop().unwrap();
}

#[test]
fn test_invalid_input_rejected() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        DataLogger::new(config(&dir).with_worker_count(0)),
        Err(LoggerError::Config(ConfigError::ValidationError(_)))
    ));

    let logger = DataLogger::new(config(&dir)).unwrap();
    assert!(matches!(
        logger.submit(LogItem::new(1, 0, vec![1, 2, 3])),
        Err(LoggerError::InvalidItem { .. })
    ));
    assert_eq!(logger.health().queue_depth, 0);
}
