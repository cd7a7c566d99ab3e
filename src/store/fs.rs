//! Shared filesystem primitives for durable state.
//!
//! Both storage shapes route through here: structured singleton documents use
//! [`atomic_replace`] (temp-write-then-rename, crash-safe), append-oriented
//! logs use [`append_line`] (exclusive-append under an advisory lock).
//! Read-modify-write cycles additionally hold a per-resource sidecar lock via
//! [`acquire`] so two writers never interleave between the read and the
//! rename.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

/// Outcome of a lock acquisition attempt.
#[derive(Debug)]
pub(crate) enum LockError {
    /// Still held by another writer after every retry.
    Contended { attempts: u32 },
    Io(io::Error),
}

/// An exclusive advisory lock on a sidecar file, released on drop.
#[derive(Debug)]
pub(crate) struct ResourceLock {
    file: File,
    path: PathBuf,
}

impl ResourceLock {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        // Unlock errors on drop have no recovery path; the OS releases the
        // lock when the descriptor closes anyway.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquire an exclusive advisory lock, retrying a bounded number of times.
pub(crate) fn acquire(
    lock_path: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<ResourceLock, LockError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(LockError::Io)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(LockError::Io)?;

    for attempt in 1..=attempts {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(ResourceLock {
                    file,
                    path: lock_path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                if attempt < attempts {
                    std::thread::sleep(backoff);
                }
            }
            Err(err) => return Err(LockError::Io(err)),
        }
    }
    Err(LockError::Contended { attempts })
}

/// Replace a file's contents atomically: write a temp sibling, then rename.
///
/// Readers see either the old document or the new one, never a torn write.
pub(crate) fn atomic_replace(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("singleton"),
        std::process::id()
    ));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one line to a log file under an exclusive lock on the file itself.
pub(crate) fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let result = (|| {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    })();
    let _ = FileExt::unlock(&file);
    result
}

/// Read a file to string, treating a missing file as empty.
pub(crate) fn read_to_string_or_empty(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}
