//! Process-wide install lock
//!
//! Operations that touch the installed-games store, the manifest cache or
//! an install directory hold an [`InstallLock`]. Acquisition never waits: a
//! lock held by another process fails with [`InstallError::InstallLocked`].

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{InstallError, Result};

/// Exclusive advisory lock, released on drop
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Take the lock at `path`, creating the file if needed
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!("Acquired install lock {}", path.display());
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(TryLockError::WouldBlock) => {
                Err(InstallError::InstallLocked(path.display().to_string()))
            }
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    /// Lock file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!("Released install lock {}", self.path.display());
    }
}
