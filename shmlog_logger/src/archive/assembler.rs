//! Offline assembly of per-message files into one archive per source.
//!
//! Sources are independent: each one runs `load → write partial → verify →
//! publish → remove sources` on its own, and a failure in one never touches
//! the files or archive of another.

use super::format::{ArchiveFile, ArchiveWriter, FileBytes};
use crate::config::{AssemblyOptions, SessionInfo, now_epoch_us};
use crate::error::{ArchiveError, ArchiveResult};
use crate::item::{MessageKey, ONSET_PAYLOAD_LEN};
use shmlog_common::consts::{ARCHIVE_EXTENSION, PARTIAL_SUFFIX};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

/// `<log_dir>/{source_id:03}_log.arc`
pub fn archive_path(log_dir: &Path, source_id: u8) -> PathBuf {
    log_dir.join(format!("{source_id:03}_log.{ARCHIVE_EXTENSION}"))
}

fn partial_path(log_dir: &Path, source_id: u8) -> PathBuf {
    log_dir.join(format!("{source_id:03}_log.{ARCHIVE_EXTENSION}.{PARTIAL_SUFFIX}"))
}

/// Decode an onset payload.
pub(crate) fn decode_onset(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; ONSET_PAYLOAD_LEN] = bytes.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// One published archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    pub source_id: u8,
    pub path: PathBuf,
    /// Entries excluding the onset record.
    pub message_count: usize,
    pub onset_us: u64,
}

/// Outcome of one assembly run.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    /// Archives published, by ascending source id.
    pub archives: Vec<SourceArchive>,
    /// Sources that failed; their message files are untouched.
    pub failures: Vec<(u8, ArchiveError)>,
}

impl AssemblyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The archives, or the first failure.
    pub fn into_result(self) -> ArchiveResult<Vec<SourceArchive>> {
        match self.failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(self.archives),
        }
    }
}

/// Merge every `*.msg` file in `log_dir` into per-source archives.
///
/// # Errors
///
/// Only failure to list `log_dir` is returned directly. Per-source failures
/// are collected in [`AssemblyReport::failures`].
pub fn assemble_log_archives(log_dir: &Path, options: &AssemblyOptions) -> ArchiveResult<AssemblyReport> {
    let sources = scan_sources(log_dir)?;
    let mut report = AssemblyReport::default();
    if sources.is_empty() {
        info!(dir = %log_dir.display(), "no message files to assemble");
        return Ok(report);
    }

    let session_onset = SessionInfo::load(log_dir).map(|s| s.onset_us);
    let workers = options.resolve_workers().min(sources.len());
    let total: usize = sources.iter().map(|(_, files)| files.len()).sum();
    info!(
        dir = %log_dir.display(),
        sources = sources.len(),
        files = total,
        workers,
        "assembling archives"
    );

    let next = AtomicUsize::new(0);
    let results: Vec<(u8, ArchiveResult<SourceArchive>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some((source_id, files)) = sources.get(i) else {
                            break;
                        };
                        let result = assemble_source(log_dir, *source_id, files, options, session_onset);
                        done.push((*source_id, result));
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    for (source_id, result) in results {
        match result {
            Ok(archive) => report.archives.push(archive),
            Err(e) => {
                error!(source_id, error = %e, "assembly failed");
                report.failures.push((source_id, e));
            }
        }
    }
    report.archives.sort_by_key(|a| a.source_id);
    report.failures.sort_by_key(|(id, _)| *id);
    info!(
        archives = report.archives.len(),
        failures = report.failures.len(),
        "assembly finished"
    );
    Ok(report)
}

type SourceFiles = Vec<(MessageKey, PathBuf)>;

/// Message files anywhere below `log_dir`, grouped by source, each group
/// ordered by key then path. Symbolic links are not followed.
fn scan_sources(log_dir: &Path) -> ArchiveResult<Vec<(u8, SourceFiles)>> {
    let mut groups: BTreeMap<u8, SourceFiles> = BTreeMap::new();
    let mut pending = vec![log_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(MessageKey::from_file_name) else {
                continue;
            };
            groups.entry(key.source_id).or_default().push((key, entry.path()));
        }
    }
    for files in groups.values_mut() {
        files.sort();
    }
    Ok(groups.into_iter().collect())
}

fn assemble_source(
    log_dir: &Path,
    source_id: u8,
    files: &[(MessageKey, PathBuf)],
    options: &AssemblyOptions,
    session_onset: Option<u64>,
) -> ArchiveResult<SourceArchive> {
    let source = LoadedSource::load(log_dir, source_id, files, options, session_onset)?;
    let (partial, message_count) = source.write_partial(log_dir)?;
    if options.verify_integrity {
        source.verify(partial.path(), options.memory_mapping)?;
    }
    let path = archive_path(log_dir, source_id);
    partial.publish(&path)?;

    let onset_us = source.onset_us;
    if options.remove_sources {
        source.remove_sources();
    }

    let archive = SourceArchive {
        source_id,
        path,
        message_count,
        onset_us,
    };
    if options.verbose {
        info!(source_id, messages = message_count, path = %archive.path.display(), "archive published");
    } else {
        debug!(source_id, messages = message_count, "archive published");
    }
    Ok(archive)
}

/// Archive being written under its partial name. Deleted unless published.
struct PartialFile {
    path: PathBuf,
    published: bool,
}

impl PartialFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn publish(mut self, to: &Path) -> ArchiveResult<()> {
        fs::rename(&self.path, to)?;
        self.published = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.path);
        }
    }
}

enum Entry<'a> {
    File { path: &'a Path, bytes: &'a [u8] },
    Inline(&'a [u8]),
}

impl Entry<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Entry::File { bytes, .. } | Entry::Inline(bytes) => *bytes,
        }
    }
}

/// Everything one archive is built from.
struct LoadedSource {
    source_id: u8,
    files: Vec<(MessageKey, PathBuf, FileBytes)>,
    existing: Option<ArchiveFile>,
    onset_us: u64,
    onset_bytes: [u8; ONSET_PAYLOAD_LEN],
    /// Onset entry comes from outside the message files and archive.
    synthesized_onset: bool,
}

impl LoadedSource {
    fn load(
        log_dir: &Path,
        source_id: u8,
        files: &[(MessageKey, PathBuf)],
        options: &AssemblyOptions,
        session_onset: Option<u64>,
    ) -> ArchiveResult<Self> {
        let mut loaded = Vec::with_capacity(files.len());
        for (key, path) in files {
            let bytes = FileBytes::load(path, options.memory_mapping)?;
            loaded.push((*key, path.clone(), bytes));
        }

        let existing_path = archive_path(log_dir, source_id);
        let existing = if existing_path.exists() {
            debug!(source_id, path = %existing_path.display(), "merging existing archive");
            Some(ArchiveFile::open_with(&existing_path, options.memory_mapping)?)
        } else {
            None
        };

        let onset_key = MessageKey::onset(source_id);
        let malformed_onset = |what: &str| ArchiveError::Format {
            path: existing_path.clone(),
            reason: format!("{what} onset entry of source {source_id:03} is not {ONSET_PAYLOAD_LEN} bytes"),
        };
        let file_onset = loaded.iter().rev().find(|(key, _, _)| *key == onset_key);
        let archived_onset = existing
            .as_ref()
            .and_then(|archive| archive.get(&onset_key.to_string()));

        let (onset_us, synthesized_onset) = if let Some(us) = options.onset_us {
            (us, true)
        } else if let Some((_, _, bytes)) = file_onset {
            (decode_onset(bytes).ok_or_else(|| malformed_onset("message file"))?, false)
        } else if let Some(bytes) = archived_onset {
            (decode_onset(bytes).ok_or_else(|| malformed_onset("archived"))?, false)
        } else if let Some(us) = session_onset {
            (us, true)
        } else {
            let now = now_epoch_us();
            warn!(source_id, onset_us = now, "no onset recorded, using the current time");
            (now, true)
        };

        Ok(Self {
            source_id,
            files: loaded,
            existing,
            onset_us,
            onset_bytes: onset_us.to_le_bytes(),
            synthesized_onset,
        })
    }

    /// Final entry set. Later sources override earlier ones: existing
    /// archive, then message files in order, then a synthesized onset.
    fn merged(&self) -> ArchiveResult<BTreeMap<MessageKey, Entry<'_>>> {
        let mut merged = BTreeMap::new();
        if let Some(archive) = &self.existing {
            for (key, bytes) in archive.entries() {
                let key: MessageKey = key.parse().map_err(|_| ArchiveError::Format {
                    path: archive.path().to_path_buf(),
                    reason: format!("foreign key {key:?}"),
                })?;
                merged.insert(key, Entry::Inline(bytes));
            }
        }
        for (key, path, bytes) in &self.files {
            merged.insert(*key, Entry::File { path, bytes });
        }
        if self.synthesized_onset {
            merged.insert(MessageKey::onset(self.source_id), Entry::Inline(&self.onset_bytes));
        }
        Ok(merged)
    }

    /// Write every entry to the partial archive. Returns the guard and the
    /// message count (onset excluded).
    fn write_partial(&self, log_dir: &Path) -> ArchiveResult<(PartialFile, usize)> {
        let partial = PartialFile {
            path: partial_path(log_dir, self.source_id),
            published: false,
        };
        let merged = self.merged()?;
        let mut writer = ArchiveWriter::create(partial.path())?;
        for (key, entry) in &merged {
            writer.append(&key.to_string(), entry.bytes())?;
        }
        let count = writer.finish(true)?;
        Ok((partial, count.saturating_sub(1)))
    }

    /// Reopen the partial archive and compare it with the sources, reading
    /// message files from disk again.
    fn verify(&self, partial: &Path, memory_mapping: bool) -> ArchiveResult<()> {
        let written = ArchiveFile::open_with(partial, memory_mapping)?;
        let merged = self.merged()?;
        let mismatch = |key: &MessageKey| ArchiveError::IntegrityMismatch {
            source_id: self.source_id,
            key: key.to_string(),
        };

        if written.len() != merged.len() {
            let first_missing = merged
                .keys()
                .find(|key| !written.contains(&key.to_string()))
                .copied()
                .unwrap_or(MessageKey::onset(self.source_id));
            return Err(mismatch(&first_missing));
        }
        for (key, entry) in &merged {
            let stored = written.get(&key.to_string()).ok_or_else(|| mismatch(key))?;
            let matches = match entry {
                Entry::File { path, .. } => fs::read(path)? == stored,
                Entry::Inline(bytes) => *bytes == stored,
            };
            if !matches {
                return Err(mismatch(key));
            }
        }
        debug!(source_id = self.source_id, entries = merged.len(), "archive verified");
        Ok(())
    }

    fn remove_sources(self) {
        let Self { files, source_id, .. } = self;
        for (_, path, bytes) in files {
            drop(bytes);
            if let Err(e) = fs::remove_file(&path) {
                warn!(source_id, path = %path.display(), error = %e, "failed to remove message file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_msg(dir: &Path, source: u8, ts: u64, payload: &[u8]) -> PathBuf {
        let path = dir.join(MessageKey::new(source, ts).file_name());
        fs::write(&path, payload).unwrap();
        path
    }

    #[test]
    fn test_scan_groups_and_orders() {
        let dir = TempDir::new().unwrap();
        write_msg(dir.path(), 2, 50, &[1]);
        write_msg(dir.path(), 1, 200, &[2]);
        write_msg(dir.path(), 1, 100, &[3]);
        fs::write(dir.path().join("001_00000000000000000300.msg.0.partial"), [4]).unwrap();
        fs::write(dir.path().join("session.toml"), "x").unwrap();

        let sources = scan_sources(dir.path()).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].0, 1);
        let keys: Vec<u64> = sources[0].1.iter().map(|(k, _)| k.elapsed_us).collect();
        assert_eq!(keys, [100, 200]);
        assert_eq!(sources[1].0, 2);
    }

    #[test]
    fn test_scan_descends_into_subdirectories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("part_a").join("late");
        fs::create_dir_all(&nested).unwrap();
        write_msg(dir.path(), 3, 20, &[1]);
        let deep = write_msg(&nested, 3, 10, &[2]);
        write_msg(&dir.path().join("part_a"), 5, 30, &[3]);
        std::os::unix::fs::symlink(&nested, dir.path().join("linked")).unwrap();

        let sources = scan_sources(dir.path()).unwrap();
        let ids: Vec<u8> = sources.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [3, 5]);
        assert_eq!(sources[0].1.len(), 2);
        assert_eq!(sources[0].1[0], (MessageKey::new(3, 10), deep));
    }

    #[test]
    fn test_tampered_source_fails_verification() {
        let dir = TempDir::new().unwrap();
        write_msg(dir.path(), 4, 10, &[1, 2, 3]);
        let victim = write_msg(dir.path(), 4, 20, &[4, 5, 6]);
        let options = AssemblyOptions {
            memory_mapping: false,
            onset_us: Some(1_000),
            ..AssemblyOptions::default()
        };
        let files = scan_sources(dir.path()).unwrap().remove(0).1;

        let source = LoadedSource::load(dir.path(), 4, &files, &options, None).unwrap();
        let (partial, count) = source.write_partial(dir.path()).unwrap();
        assert_eq!(count, 2);
        source.verify(partial.path(), false).unwrap();

        fs::write(&victim, [9, 9, 9]).unwrap();
        let err = source.verify(partial.path(), false).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::IntegrityMismatch { source_id: 4, ref key } if key == "004_00000000000000000020"
        ));

        let partial_path = partial.path().to_path_buf();
        drop(partial);
        assert!(!partial_path.exists());
        assert!(!archive_path(dir.path(), 4).exists());
    }

    #[test]
    fn test_onset_precedence() {
        let dir = TempDir::new().unwrap();
        write_msg(dir.path(), 1, 0, &77u64.to_le_bytes());
        write_msg(dir.path(), 1, 5, &[1]);
        let files = scan_sources(dir.path()).unwrap().remove(0).1;

        let recorded = LoadedSource::load(dir.path(), 1, &files, &AssemblyOptions::default(), Some(5)).unwrap();
        assert_eq!(recorded.onset_us, 77);
        assert!(!recorded.synthesized_onset);

        let overridden = AssemblyOptions {
            onset_us: Some(99),
            ..AssemblyOptions::default()
        };
        let forced = LoadedSource::load(dir.path(), 1, &files, &overridden, Some(5)).unwrap();
        assert_eq!(forced.onset_us, 99);
        let merged = forced.merged().unwrap();
        assert_eq!(merged[&MessageKey::onset(1)].bytes(), 99u64.to_le_bytes());

        let no_onset: Vec<_> = files.into_iter().filter(|(k, _)| !k.is_onset()).collect();
        let session = LoadedSource::load(dir.path(), 1, &no_onset, &AssemblyOptions::default(), Some(5)).unwrap();
        assert_eq!(session.onset_us, 5);
    }

    #[test]
    fn test_malformed_onset_file() {
        let dir = TempDir::new().unwrap();
        write_msg(dir.path(), 3, 0, &[1, 2]);
        let report = assemble_log_archives(dir.path(), &AssemblyOptions::default()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].1, ArchiveError::Format { .. }));
        assert!(dir.path().join(MessageKey::onset(3).file_name()).exists());
    }
}
