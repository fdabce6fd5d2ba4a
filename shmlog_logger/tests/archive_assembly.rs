//! Archive assembly over hand-written log directories.

use shmlog_logger::{
    ArchiveError, ArchiveFile, ArchiveReader, AssemblyOptions, MessageKey, OnsetSource,
    archive_path, assemble_log_archives,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ONSET: u64 = 1_700_000_000_000_000;

fn write_msg(dir: &Path, source: u8, ts: u64, payload: &[u8]) -> PathBuf {
    let path = dir.join(MessageKey::new(source, ts).file_name());
    fs::write(&path, payload).unwrap();
    path
}

fn write_source(dir: &Path, source: u8, count: u64) {
    write_msg(dir, source, 0, &ONSET.to_le_bytes());
    for ts in 1..=count {
        write_msg(dir, source, ts * 10, &[source, ts as u8, 0xAB]);
    }
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_m_files_give_m_plus_one_entries() {
    let dir = TempDir::new().unwrap();
    for ts in 1..=25u64 {
        write_msg(dir.path(), 5, ts, &[ts as u8]);
    }

    let options = AssemblyOptions {
        onset_us: Some(ONSET),
        ..AssemblyOptions::default()
    };
    let archives = assemble_log_archives(dir.path(), &options)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].message_count, 25);
    assert_eq!(archives[0].onset_us, ONSET);

    let archive = ArchiveFile::open(&archives[0].path).unwrap();
    assert_eq!(archive.len(), 26);
    assert_eq!(archive.get(&MessageKey::onset(5).to_string()), Some(&ONSET.to_le_bytes()[..]));
    assert_eq!(dir_names(dir.path()), ["005_log.arc"]);
}

#[test]
fn test_sources_assembled_in_parallel() {
    let dir = TempDir::new().unwrap();
    for source in 1..=6u8 {
        write_source(dir.path(), source, u64::from(source) * 7);
    }
    let options = AssemblyOptions {
        max_workers: Some(3),
        verify_integrity: true,
        ..AssemblyOptions::default()
    };
    let report = assemble_log_archives(dir.path(), &options).unwrap();
    assert!(report.is_success());
    let ids: Vec<u8> = report.archives.iter().map(|a| a.source_id).collect();
    assert_eq!(ids, [1, 2, 3, 4, 5, 6]);

    for archive in &report.archives {
        assert_eq!(archive.message_count, usize::from(archive.source_id) * 7);
        let reader = ArchiveReader::open(&archive.path).unwrap();
        assert_eq!(reader.source_id(), archive.source_id);
        assert_eq!(reader.onset_timestamp_us().unwrap(), ONSET);
        assert_eq!(reader.onset().unwrap().source, OnsetSource::Recorded);
        let (timestamps, payloads) = reader.read_all_messages().unwrap();
        assert_eq!(timestamps[0], ONSET + 10);
        assert_eq!(payloads[0], [archive.source_id, 1, 0xAB]);
    }
}

#[test]
fn test_nothing_to_assemble() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("session.toml"), "garbage").unwrap();
    fs::write(dir.path().join("002_00000000000000000001.msg.0.partial"), [1]).unwrap();
    fs::create_dir(dir.path().join("003_00000000000000000001.msg")).unwrap();

    let report = assemble_log_archives(dir.path(), &AssemblyOptions::default()).unwrap();
    assert!(report.archives.is_empty());
    assert!(report.is_success());
    assert!(!archive_path(dir.path(), 2).exists());
    assert!(!archive_path(dir.path(), 3).exists());
}

#[test]
fn test_keep_sources_and_owned_loading() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), 1, 5);
    write_msg(dir.path(), 1, 99, &[]);
    let options = AssemblyOptions {
        remove_sources: false,
        memory_mapping: false,
        verify_integrity: true,
        ..AssemblyOptions::default()
    };
    let archives = assemble_log_archives(dir.path(), &options)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(archives[0].message_count, 6);
    assert_eq!(dir_names(dir.path()).len(), 8);

    let reader = ArchiveReader::open(&archives[0].path).unwrap();
    let last = reader.iter_messages(None).unwrap().last().unwrap().unwrap();
    assert_eq!(last.key, MessageKey::new(1, 99));
    assert!(last.payload.is_empty());
}

#[test]
fn test_reassembly_merges_existing_archive() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), 4, 3);
    assemble_log_archives(dir.path(), &AssemblyOptions::default())
        .unwrap()
        .into_result()
        .unwrap();

    write_msg(dir.path(), 4, 20, &[0xFF]);
    write_msg(dir.path(), 4, 500, &[5]);
    let archives = assemble_log_archives(
        dir.path(),
        &AssemblyOptions {
            verify_integrity: true,
            ..AssemblyOptions::default()
        },
    )
    .unwrap()
    .into_result()
    .unwrap();

    assert_eq!(archives[0].message_count, 4);
    assert_eq!(archives[0].onset_us, ONSET);
    let reader = ArchiveReader::open(&archives[0].path).unwrap();
    let elapsed: Vec<u64> = reader.message_keys().iter().map(|k| k.elapsed_us).collect();
    assert_eq!(elapsed, [10, 20, 30, 500]);
    let replaced = reader
        .iter_messages(Some(&[MessageKey::new(4, 20)]))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(replaced.payload, [0xFF]);
    assert_eq!(dir_names(dir.path()), ["004_log.arc"]);
}

#[test]
fn test_failed_source_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), 1, 3);
    write_source(dir.path(), 2, 3);
    fs::write(archive_path(dir.path(), 2), b"not an archive at all, definitely").unwrap();

    let report = assemble_log_archives(dir.path(), &AssemblyOptions::default()).unwrap();
    assert_eq!(report.archives.len(), 1);
    assert_eq!(report.archives[0].source_id, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, 2);
    assert!(matches!(report.failures[0].1, ArchiveError::NotAnArchive { .. }));

    let remaining: Vec<String> = dir_names(dir.path())
        .into_iter()
        .filter(|n| n.starts_with("002_") && n.ends_with(".msg"))
        .collect();
    assert_eq!(remaining.len(), 4);
    assert!(!dir.path().join("002_log.arc.partial").exists());
    assert!(matches!(
        assemble_log_archives(dir.path(), &AssemblyOptions::default())
            .unwrap()
            .into_result(),
        Err(ArchiveError::NotAnArchive { .. })
    ));
}

#[test]
fn test_message_files_in_subdirectories() {
    let dir = TempDir::new().unwrap();
    let shard = dir.path().join("shard_1");
    fs::create_dir(&shard).unwrap();
    write_source(dir.path(), 6, 3);
    write_msg(&shard, 6, 25, &[0xEE]);
    write_msg(&shard, 7, 10, &[0x01]);

    let options = AssemblyOptions {
        onset_us: Some(ONSET),
        ..AssemblyOptions::default()
    };
    let archives = assemble_log_archives(dir.path(), &options)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(archives.len(), 2);
    assert_eq!(archives[0].path, archive_path(dir.path(), 6));
    assert_eq!(archives[0].message_count, 4);
    assert_eq!(archives[1].path, archive_path(dir.path(), 7));

    let archive = ArchiveFile::open(&archives[0].path).unwrap();
    assert_eq!(archive.get(&MessageKey::new(6, 25).to_string()), Some(&[0xEE][..]));
    assert_eq!(dir_names(dir.path()), ["006_log.arc", "007_log.arc", "shard_1"]);
    assert!(dir_names(&shard).is_empty());
}

#[test]
fn test_missing_directory() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        assemble_log_archives(&dir.path().join("absent"), &AssemblyOptions::default()),
        Err(ArchiveError::Io(_))
    ));
}
