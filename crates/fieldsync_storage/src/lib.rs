//! # fieldsync Storage
//!
//! Byte-level storage for the fieldsync offline engine.
//!
//! Backends are **opaque byte stores**: they read, append, flush and
//! atomically replace bytes without knowing what those bytes mean. The
//! [`Journal`] layers a framed, checksummed record format on top so that
//! higher layers can persist their state as an append-only log.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral engines
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_storage::{InMemoryBackend, Journal};
//!
//! let mut journal = Journal::open(Box::new(InMemoryBackend::new())).unwrap();
//! journal.append(1, b"hello").unwrap();
//! let scan = journal.scan().unwrap();
//! assert_eq!(scan.entries.len(), 1);
//! assert_eq!(scan.entries[0].payload, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{
    compute_crc32, encode_frame, Journal, JournalEntry, JournalScan, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
pub use memory::InMemoryBackend;
