//! Archive container format.
//!
//! ```text
//! 0      8        10     12      16             24          32
//! ┌──────┬────────┬──────┬───────┬──────────────┬───────────┐
//! │magic │version │flags │count  │index_offset  │index_len  │  header (LE)
//! ├──────┴────────┴──────┴───────┴──────────────┴───────────┤
//! │ entry bytes, back to back                               │
//! ├─────────────────────────────────────────────────────────┤
//! │ index: (key_len u16, key, offset u64, len u64) × count  │  sorted by key
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are stored uncompressed so a mapped archive serves payloads as
//! slices without copying.

use crate::error::{ArchiveError, ArchiveResult};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};

pub const ARCHIVE_MAGIC: [u8; 8] = *b"SHMLARC\0";
pub const ARCHIVE_VERSION: u16 = 1;
pub const ARCHIVE_HEADER_LEN: usize = 32;
/// Smallest index record: key length, empty key, offset and length.
const MIN_INDEX_ENTRY_LEN: usize = 2 + 8 + 8;

/// Contents of a file, either mapped or read into memory.
pub(crate) enum FileBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl FileBytes {
    /// Load `path`. Empty files are always read, since they cannot be mapped.
    pub(crate) fn load(path: &Path, memory_mapping: bool) -> std::io::Result<Self> {
        if !memory_mapping {
            return Ok(Self::Owned(std::fs::read(path)?));
        }
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::Owned(Vec::new()));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(mmap))
    }
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Owned(bytes) => bytes,
        }
    }
}

struct IndexEntry {
    key: String,
    offset: u64,
    len: u64,
}

/// Streaming archive writer. Entries may be appended in any order; the
/// index is sorted on [`finish`](Self::finish).
pub struct ArchiveWriter {
    out: BufWriter<File>,
    path: PathBuf,
    entries: Vec<IndexEntry>,
    offset: u64,
}

impl ArchiveWriter {
    /// Create (or truncate) `path` and reserve the header.
    pub fn create(path: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let path = path.into();
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(&[0u8; ARCHIVE_HEADER_LEN])?;
        Ok(Self {
            out,
            path,
            entries: Vec::new(),
            offset: ARCHIVE_HEADER_LEN as u64,
        })
    }

    pub fn append(&mut self, key: &str, data: &[u8]) -> ArchiveResult<()> {
        if key.len() > usize::from(u16::MAX) {
            return Err(self.format_error(format!("key of {} bytes is too long", key.len())));
        }
        self.out.write_all(data)?;
        self.entries.push(IndexEntry {
            key: key.to_string(),
            offset: self.offset,
            len: data.len() as u64,
        });
        self.offset += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the index and header. Returns the number of entries.
    pub fn finish(mut self, sync: bool) -> ArchiveResult<usize> {
        self.entries.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(dup) = self.entries.windows(2).find(|w| w[0].key == w[1].key) {
            let reason = format!("duplicate key {}", dup[0].key);
            return Err(self.format_error(reason));
        }
        let count = u32::try_from(self.entries.len())
            .map_err(|_| self.format_error("too many entries".to_string()))?;

        let index_offset = self.offset;
        let mut index_len = 0u64;
        for entry in &self.entries {
            let key = entry.key.as_bytes();
            self.out.write_all(&(key.len() as u16).to_le_bytes())?;
            self.out.write_all(key)?;
            self.out.write_all(&entry.offset.to_le_bytes())?;
            self.out.write_all(&entry.len.to_le_bytes())?;
            index_len += (2 + key.len() + 16) as u64;
        }

        let mut header = [0u8; ARCHIVE_HEADER_LEN];
        header[0..8].copy_from_slice(&ARCHIVE_MAGIC);
        header[8..10].copy_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&count.to_le_bytes());
        header[16..24].copy_from_slice(&index_offset.to_le_bytes());
        header[24..32].copy_from_slice(&index_len.to_le_bytes());

        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        if sync {
            file.sync_all()?;
        }
        Ok(self.entries.len())
    }

    fn format_error(&self, reason: String) -> ArchiveError {
        ArchiveError::Format {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Read-only view of an archive with random keyed access.
pub struct ArchiveFile {
    path: PathBuf,
    bytes: FileBytes,
    index: Vec<(String, Range<usize>)>,
}

impl ArchiveFile {
    /// Open and memory-map `path`.
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        Self::open_with(path, true)
    }

    /// Open `path`, mapping it or reading it into memory.
    pub fn open_with(path: impl AsRef<Path>, memory_mapping: bool) -> ArchiveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = FileBytes::load(&path, memory_mapping)?;
        let index = parse_index(&path, &bytes)?;
        Ok(Self { path, bytes, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.index.iter().map(|(key, _)| key.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.index
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| &self.bytes[self.index[i].1.clone()])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// `(key, bytes)` pairs in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
        self.index
            .iter()
            .map(|(key, range)| (key.as_str(), &self.bytes[range.clone()]))
    }
}

impl std::fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .finish()
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn parse_index(path: &Path, bytes: &[u8]) -> ArchiveResult<Vec<(String, Range<usize>)>> {
    if bytes.len() < ARCHIVE_HEADER_LEN || bytes[0..8] != ARCHIVE_MAGIC {
        return Err(ArchiveError::NotAnArchive {
            path: path.to_path_buf(),
        });
    }
    let malformed = |reason: String| ArchiveError::Format {
        path: path.to_path_buf(),
        reason,
    };

    let version = read_u16(bytes, 8);
    if version != ARCHIVE_VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let count = read_u32(bytes, 12) as usize;
    let index_offset = read_u64(bytes, 16) as usize;
    let index_len = read_u64(bytes, 24) as usize;
    let index_end = index_offset
        .checked_add(index_len)
        .filter(|&end| index_offset >= ARCHIVE_HEADER_LEN && end <= bytes.len())
        .ok_or_else(|| malformed("index out of bounds".to_string()))?;

    if count > index_len / MIN_INDEX_ENTRY_LEN {
        return Err(malformed(format!(
            "{count} entries cannot fit in a {index_len}-byte index"
        )));
    }

    let mut index = Vec::with_capacity(count);
    let mut at = index_offset;
    for _ in 0..count {
        if at + 2 > index_end {
            return Err(malformed("truncated index".to_string()));
        }
        let key_len = usize::from(read_u16(bytes, at));
        at += 2;
        if at + key_len + 16 > index_end {
            return Err(malformed("truncated index".to_string()));
        }
        let key = std::str::from_utf8(&bytes[at..at + key_len])
            .map_err(|_| malformed("key is not UTF-8".to_string()))?
            .to_string();
        at += key_len;
        let offset = read_u64(bytes, at) as usize;
        let len = read_u64(bytes, at + 8) as usize;
        at += 16;

        let end = offset
            .checked_add(len)
            .filter(|&end| offset >= ARCHIVE_HEADER_LEN && end <= index_offset)
            .ok_or_else(|| malformed(format!("entry {key} out of bounds")))?;
        if index.last().is_some_and(|(prev, _): &(String, Range<usize>)| *prev >= key) {
            return Err(malformed(format!("index not sorted at {key}")));
        }
        index.push((key, offset..end));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.arc");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append("b", &[4, 5, 6]).unwrap();
        writer.append("a", &[1, 2, 3]).unwrap();
        writer.append("c", &[]).unwrap();
        assert_eq!(writer.finish(true).unwrap(), 3);

        for mapped in [true, false] {
            let archive = ArchiveFile::open_with(&path, mapped).unwrap();
            assert_eq!(archive.keys().collect::<Vec<_>>(), ["a", "b", "c"]);
            assert_eq!(archive.get("a"), Some(&[1u8, 2, 3][..]));
            assert_eq!(archive.get("b"), Some(&[4u8, 5, 6][..]));
            assert_eq!(archive.get("c"), Some(&[][..]));
            assert_eq!(archive.get("d"), None);
        }
    }

    #[test]
    fn test_empty_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.arc");
        assert_eq!(ArchiveWriter::create(&path).unwrap().finish(false).unwrap(), 0);
        let archive = ArchiveFile::open(&path).unwrap();
        assert!(archive.is_empty());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("dup.arc")).unwrap();
        writer.append("k", &[1]).unwrap();
        writer.append("k", &[2]).unwrap();
        assert!(matches!(writer.finish(false), Err(ArchiveError::Format { .. })));
    }

    #[test]
    fn test_foreign_and_truncated_files() {
        let dir = TempDir::new().unwrap();
        let foreign = dir.path().join("foreign.arc");
        std::fs::write(&foreign, b"definitely not an archive, just text").unwrap();
        assert!(matches!(
            ArchiveFile::open(&foreign),
            Err(ArchiveError::NotAnArchive { .. })
        ));

        let empty = dir.path().join("zero.arc");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            ArchiveFile::open(&empty),
            Err(ArchiveError::NotAnArchive { .. })
        ));

        let path = dir.path().join("cut.arc");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append("key", &[7; 64]).unwrap();
        writer.finish(false).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            ArchiveFile::open(&path),
            Err(ArchiveError::Format { .. })
        ));
    }
}
