//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod inspect;
pub mod queue;
pub mod verify;

use fieldsync_engine::{DataDir, LocalStore, OperationQueue, SystemClock};
use std::path::Path;
use std::sync::Arc;

/// A data directory opened for offline inspection.
pub struct SyncDir {
    /// The locked directory.
    pub dir: DataDir,
    /// The replayed operation queue.
    pub queue: OperationQueue,
    /// The replayed resource cache.
    pub store: LocalStore,
}

impl SyncDir {
    /// Opens an existing data directory and replays both journals.
    pub fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = DataDir::open(path, false)?;
        let queue = OperationQueue::open(
            Box::new(dir.operations_backend()?),
            Arc::new(SystemClock),
        )?;
        let store = LocalStore::open(Box::new(dir.resources_backend()?))?;
        Ok(Self { dir, queue, store })
    }

    #[cfg(test)]
    pub fn open_or_create(path: &Path) -> Self {
        DataDir::open(path, true).unwrap();
        Self::open(path).unwrap()
    }
}

/// Formats a byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Size of a file, or zero if it does not exist.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
