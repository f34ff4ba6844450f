//! Exclusive advisory locking for the shared JSON documents.
//!
//! The pool and task files are mutated by this agent and read by external
//! tooling, so every read-modify-write happens on a descriptor holding an
//! exclusive `flock`. Uses the `fs2` crate (std::fs::File::lock() requires
//! Rust 1.89+, MSRV here is 1.75).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from lock acquisition and locked I/O.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open {0}: {1}")]
    Open(PathBuf, #[source] io::Error),

    #[error("Failed to acquire lock on {0}: {1}")]
    Acquire(PathBuf, #[source] io::Error),

    #[error("I/O on locked file {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

/// A data file held under an exclusive advisory lock.
///
/// The lock covers the file's own descriptor and is released when the guard
/// is dropped (fs2 unlocks on close).
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open `path` read-write (creating it if absent) and block until the
    /// exclusive lock is held.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open(path.to_path_buf(), e))?;

        file.lock_exclusive()
            .map_err(|e| LockError::Acquire(path.to_path_buf(), e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Read the full contents from the start of the file.
    pub fn read_to_string(&mut self) -> Result<String, LockError> {
        let mut content = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut content))
            .map_err(|e| LockError::Io(self.path.clone(), e))?;
        Ok(content)
    }

    /// Replace the file contents: truncate, write, flush, fsync. The lock
    /// stays held throughout, so readers never observe a partial document.
    pub fn replace_contents(&mut self, contents: &[u8]) -> Result<(), LockError> {
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.set_len(0))
            .and_then(|_| self.file.write_all(contents))
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_all())
            .map_err(|e| LockError::Io(self.path.clone(), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LockedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedFile").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_after_replace_sees_new_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        let mut locked = LockedFile::acquire(&path).unwrap();
        locked.replace_contents(b"{\"a\":1}").unwrap();
        assert_eq!(locked.read_to_string().unwrap(), "{\"a\":1}");

        locked.replace_contents(b"{}").unwrap();
        assert_eq!(locked.read_to_string().unwrap(), "{}");
    }

    #[test]
    fn reacquire_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        let guard = LockedFile::acquire(&path).unwrap();
        drop(guard);
        let _guard2 = LockedFile::acquire(&path).unwrap();
    }
}
