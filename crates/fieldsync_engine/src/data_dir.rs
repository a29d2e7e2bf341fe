//! Data directory management.
//!
//! ```text
//! <data_dir>/
//! ├─ LOCK             # Advisory lock for single-writer access
//! ├─ operations.log   # Operation queue journal, keyed by operation id
//! └─ resources.log    # Resource cache journal, keyed by type:id
//! ```

use crate::error::{SyncError, SyncResult};
use fieldsync_storage::FileBackend;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const OPERATIONS_FILE: &str = "operations.log";
const RESOURCES_FILE: &str = "resources.log";

/// An exclusively locked data directory.
///
/// Only one `DataDir` can exist per directory at a time, across processes.
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DataDir {
    path: PathBuf,
    _lock_file: File,
}

impl DataDir {
    /// Opens or creates a data directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidInput`] if the path is missing and
    ///   `create_if_missing` is false, or is not a directory
    /// - [`SyncError::DirectoryLocked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> SyncResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path).map_err(storage_io)?;
            } else {
                return Err(SyncError::InvalidInput(format!(
                    "data directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(SyncError::InvalidInput(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(storage_io)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::DirectoryLocked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the operation queue journal.
    #[must_use]
    pub fn operations_path(&self) -> PathBuf {
        operations_path(&self.path)
    }

    /// Path of the resource cache journal.
    #[must_use]
    pub fn resources_path(&self) -> PathBuf {
        resources_path(&self.path)
    }

    /// Opens the operation queue journal file.
    pub fn operations_backend(&self) -> SyncResult<FileBackend> {
        Ok(FileBackend::open(&self.operations_path())?)
    }

    /// Opens the resource cache journal file.
    pub fn resources_backend(&self) -> SyncResult<FileBackend> {
        Ok(FileBackend::open(&self.resources_path())?)
    }
}

/// Path of the operation queue journal inside `dir`, without locking.
#[must_use]
pub fn operations_path(dir: &Path) -> PathBuf {
    dir.join(OPERATIONS_FILE)
}

/// Path of the resource cache journal inside `dir`, without locking.
#[must_use]
pub fn resources_path(dir: &Path) -> PathBuf {
    dir.join(RESOURCES_FILE)
}

fn storage_io(err: std::io::Error) -> SyncError {
    SyncError::Storage(err.into())
}
