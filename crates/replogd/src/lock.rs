//! Advisory locks on sibling `.lock` files.
//!
//! The private log and the status file are each guarded by `<file>.lock`,
//! held for the whole of any read-modify-write against the guarded file.

use crate::error::ReplError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::trace;

/// An exclusive lock, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

/// Path of the lock file guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl FileLock {
    /// Block until the exclusive lock guarding `path` is held.
    pub fn acquire(path: &Path) -> Result<Self, ReplError> {
        let path = lock_path(path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ReplError::Lock {
                path: path.clone(),
                source,
            })?;
        FileExt::lock_exclusive(&file).map_err(|source| ReplError::Lock {
            path: path.clone(),
            source,
        })?;
        trace!("locked {}", path.display());
        Ok(Self { file, path })
    }

    /// The lock file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!("unlocked {}", self.path.display());
    }
}
