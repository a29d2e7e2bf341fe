//! Storage fault injection for unit tests.

use fieldsync_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// An in-memory backend whose next append can be made to fail halfway.
///
/// Clones share both the bytes and the fault switch, so a test keeps one
/// handle to arm faults and reopen the journal.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlakyBackend {
    inner: InMemoryBackend,
    torn_appends: Arc<Mutex<usize>>,
}

impl FlakyBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `count` appends write half their bytes and then fail.
    pub(crate) fn tear_next_appends(&self, count: usize) {
        *self.torn_appends.lock() = count;
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.inner.data()
    }
}

impl StorageBackend for FlakyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        {
            let mut torn = self.torn_appends.lock();
            if *torn > 0 {
                *torn -= 1;
                self.inner.append(&data[..data.len() / 2])?;
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn rewrite(&mut self, data: &[u8]) -> StorageResult<()> {
        self.inner.rewrite(data)
    }
}
