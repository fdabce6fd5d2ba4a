//! Linux-specific shared memory operations
//!
//! Regions are plain files under `/dev/shm`, which is the tmpfs backing
//! POSIX shared memory objects. Mapping them `MAP_SHARED` with `memmap2`
//! gives every process the same physical pages.

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::getpid;
use shmlog_common::consts::{SHM_DIR, SHM_PREFIX};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Path of the backing object for buffer `name`.
pub fn segment_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{SHM_PREFIX}{name}"))
}

/// Create a new backing file of `size` bytes and map it.
///
/// Fails with `AlreadyExists` if the file is present. The file content is
/// zero-filled by the kernel.
pub fn create_segment_mmap(path: &Path, size: usize) -> io::Result<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    if let Err(e) = file.set_len(size as u64) {
        let _ = std::fs::remove_file(path);
        return Err(e);
    }

    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok((file, mmap))
}

/// Open and map an existing backing file.
///
/// Returns `Ok(None)` when the file is shorter than `min_len`, which happens
/// while a creator is still sizing it.
pub fn attach_segment_mmap(path: &Path, min_len: usize) -> io::Result<Option<(File, MmapMut)>> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    if (file.metadata()?.len() as usize) < min_len {
        return Ok(None);
    }
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(Some((file, mmap)))
}

/// Remove a backing file. Returns `false` if it was already gone.
pub fn remove_segment_file(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Exclusive `flock(2)` held on a duplicate of a region's descriptor.
/// Released when dropped.
pub type FileLock = Flock<File>;

/// Try to take an exclusive `flock(2)` on `file` without blocking.
///
/// The lock belongs to the open file description, which the duplicate
/// shares with `file`. Returns `Ok(None)` if another description holds it.
pub fn try_lock_exclusive(file: &File) -> io::Result<Option<FileLock>> {
    match Flock::lock(file.try_clone()?, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, Errno::EWOULDBLOCK | Errno::EINTR)) => Ok(None),
        Err((_, errno)) => Err(errno.into()),
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true, // Exists, not ours to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
