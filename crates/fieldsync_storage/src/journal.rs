//! Framed, checksummed append-only journal.
//!
//! Each record is laid out as:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | len (4) | payload (len) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.
//!
//! A record that is cut short at the end of the file, or whose checksum
//! fails while being the last record, is a torn write from a crash: it is
//! reported as `torn_bytes` and cut off by [`Journal::recover`]. Damage
//! anywhere else is [`StorageError::Corrupted`].

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"FSJR";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Offset of the record header.
    pub offset: u64,
    /// Caller-defined record kind.
    pub kind: u8,
    /// Record payload.
    pub payload: Vec<u8>,
}

/// Result of scanning a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalScan {
    /// Valid records in file order.
    pub entries: Vec<JournalEntry>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Bytes after the valid prefix belonging to a torn record.
    pub torn_bytes: u64,
}

/// An append-only journal over a [`StorageBackend`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    /// Length to cut back to before the next append, left behind when a
    /// failed append could not be rolled back at once.
    dirty_from: Option<u64>,
}

impl Journal {
    /// Wraps a backend. Appends are synced to disk by default.
    pub fn open(backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        Ok(Self {
            backend,
            sync_on_write: true,
            dirty_from: None,
        })
    }

    /// Controls whether every append is followed by a full `sync`.
    ///
    /// Appends are always flushed to the OS either way.
    pub fn set_sync_on_write(&mut self, sync_on_write: bool) {
        self.sync_on_write = sync_on_write;
    }

    /// Returns the current journal size in bytes.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Appends a record and makes it durable before returning its offset.
    ///
    /// A failed append leaves no trace: whatever part of the frame reached
    /// the backend is truncated away before the error is returned, so a
    /// later successful append never lands behind a half-written record.
    pub fn append(&mut self, kind: u8, payload: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(kind, payload)?;
        if let Some(len) = self.dirty_from {
            self.backend.truncate(len)?;
            self.dirty_from = None;
        }

        let offset = self.backend.size()?;
        match self.write_frame(&frame) {
            Ok(()) => Ok(offset),
            Err(err) => {
                if self.backend.truncate(offset).is_err() {
                    self.dirty_from = Some(offset);
                }
                Err(err)
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> StorageResult<()> {
        self.backend.append(frame)?;
        self.backend.flush()?;
        if self.sync_on_write {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Reads and validates every record without modifying the journal.
    pub fn scan(&self) -> StorageResult<JournalScan> {
        let size = match self.dirty_from {
            Some(len) => len,
            None => self.backend.size()?,
        };
        let bytes = self.backend.read_at(0, size as usize)?;
        parse(&bytes)
    }

    /// Scans the journal and cuts off a torn tail so appends resume
    /// after the last valid record.
    pub fn recover(&mut self) -> StorageResult<Vec<JournalEntry>> {
        let scan = self.scan()?;
        if scan.torn_bytes > 0 || self.dirty_from.is_some() {
            self.backend.truncate(scan.valid_len)?;
            self.dirty_from = None;
        }
        Ok(scan.entries)
    }

    /// Atomically replaces the journal with the given records.
    pub fn replace(&mut self, records: &[(u8, Vec<u8>)]) -> StorageResult<()> {
        let mut data = Vec::new();
        for (kind, payload) in records {
            data.extend_from_slice(&encode_frame(*kind, payload)?);
        }
        self.backend.rewrite(&data)?;
        self.dirty_from = None;
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_write", &self.sync_on_write)
            .field("dirty_from", &self.dirty_from)
            .finish_non_exhaustive()
    }
}

/// Frames a single record.
pub fn encode_frame(kind: u8, payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len =
        u32::try_from(payload.len()).map_err(|_| StorageError::PayloadTooLarge(payload.len()))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

fn parse(bytes: &[u8]) -> StorageResult<JournalScan> {
    let total = bytes.len();
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < total {
        let offset = pos as u64;
        let torn = |pos: usize| JournalScan {
            entries: Vec::new(),
            valid_len: pos as u64,
            torn_bytes: (total - pos) as u64,
        };

        if total - pos < HEADER_SIZE {
            return Ok(JournalScan { entries, ..torn(pos) });
        }

        let header = &bytes[pos..pos + HEADER_SIZE];
        if header[0..4] != JOURNAL_MAGIC {
            if bytes[pos..].iter().all(|b| *b == 0) {
                return Ok(JournalScan { entries, ..torn(pos) });
            }
            return Err(StorageError::corrupted(offset, "bad magic"));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            return Err(StorageError::corrupted(
                offset,
                format!("unsupported journal version {version}"),
            ));
        }

        let kind = header[6];
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let end = pos + HEADER_SIZE + len + CRC_SIZE;
        if end > total {
            return Ok(JournalScan { entries, ..torn(pos) });
        }

        let body_end = end - CRC_SIZE;
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        if compute_crc32(&bytes[pos..body_end]) != stored {
            if end == total {
                return Ok(JournalScan { entries, ..torn(pos) });
            }
            return Err(StorageError::corrupted(offset, "checksum mismatch"));
        }

        entries.push(JournalEntry {
            offset,
            kind,
            payload: bytes[pos + HEADER_SIZE..body_end].to_vec(),
        });
        pos = end;
    }

    Ok(JournalScan {
        entries,
        valid_len: total as u64,
        torn_bytes: 0,
    })
}

/// CRC32 (IEEE polynomial) over `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileBackend, InMemoryBackend};
    use proptest::prelude::*;

    fn journal_over(backend: &InMemoryBackend) -> Journal {
        Journal::open(Box::new(backend.clone())).unwrap()
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        /// Half of the next append lands, then the write fails.
        TornAppend,
        /// The next append lands but the sync fails.
        FailedSync,
        /// Like `TornAppend`, and the rollback truncate fails once too.
        Stuck,
    }

    /// Wraps an in-memory backend and fails on request.
    struct FaultyBackend {
        inner: InMemoryBackend,
        fault: Option<Fault>,
        failed_truncate: bool,
    }

    impl FaultyBackend {
        fn new(inner: &InMemoryBackend, fault: Fault) -> Self {
            Self {
                inner: inner.clone(),
                fault: Some(fault),
                failed_truncate: false,
            }
        }
    }

    fn disk_full() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    impl StorageBackend for FaultyBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }
        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            match self.fault {
                Some(Fault::TornAppend | Fault::Stuck) => {
                    if self.fault == Some(Fault::TornAppend) {
                        self.fault = None;
                    }
                    self.inner.append(&data[..data.len() / 2])?;
                    Err(disk_full())
                }
                _ => self.inner.append(data),
            }
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }
        fn sync(&mut self) -> StorageResult<()> {
            if self.fault == Some(Fault::FailedSync) {
                self.fault = None;
                return Err(disk_full());
            }
            Ok(())
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            if self.fault == Some(Fault::Stuck) && !self.failed_truncate {
                self.failed_truncate = true;
                self.fault = None;
                return Err(disk_full());
            }
            self.inner.truncate(new_size)
        }
        fn rewrite(&mut self, data: &[u8]) -> StorageResult<()> {
            self.inner.rewrite(data)
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn append_then_scan() {
        let backend = InMemoryBackend::new();
        let mut journal = journal_over(&backend);

        let first = journal.append(1, b"create").unwrap();
        let second = journal.append(2, b"applied").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, (HEADER_SIZE + 6 + CRC_SIZE) as u64);

        let scan = journal.scan().unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[1].kind, 2);
        assert_eq!(scan.entries[1].payload, b"applied");
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn torn_tail_is_reported_and_recovered() {
        let mut bytes = encode_frame(1, b"kept").unwrap();
        let torn = encode_frame(1, b"half written").unwrap();
        bytes.extend_from_slice(&torn[..torn.len() - 5]);

        let backend = InMemoryBackend::with_data(bytes);
        let mut journal = journal_over(&backend);

        let scan = journal.scan().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert!(scan.torn_bytes > 0);

        let entries = journal.recover().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(backend.data().len() as u64, scan.valid_len);

        journal.append(3, b"after").unwrap();
        assert_eq!(journal.scan().unwrap().entries.len(), 2);
    }

    #[test]
    fn bad_checksum_on_last_record_is_torn() {
        let mut bytes = encode_frame(1, b"ok").unwrap();
        let mut last = encode_frame(1, b"flipped").unwrap();
        let n = last.len();
        last[n - 1] ^= 0xFF;
        bytes.extend_from_slice(&last);

        let journal = journal_over(&InMemoryBackend::with_data(bytes));
        let scan = journal.scan().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.torn_bytes, n as u64);
    }

    #[test]
    fn bad_checksum_in_the_middle_is_corruption() {
        let mut first = encode_frame(1, b"flipped").unwrap();
        first[HEADER_SIZE] ^= 0xFF;
        first.extend_from_slice(&encode_frame(1, b"ok").unwrap());

        let journal = journal_over(&InMemoryBackend::with_data(first));
        assert!(matches!(
            journal.scan(),
            Err(StorageError::Corrupted { offset: 0, .. })
        ));
    }

    #[test]
    fn zero_filled_tail_is_torn() {
        let mut bytes = encode_frame(4, b"ok").unwrap();
        bytes.extend_from_slice(&[0u8; 32]);

        let journal = journal_over(&InMemoryBackend::with_data(bytes));
        let scan = journal.scan().unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.torn_bytes, 32);
    }

    #[test]
    fn failed_append_is_rolled_back() {
        for fault in [Fault::TornAppend, Fault::FailedSync] {
            let backend = InMemoryBackend::new();
            let mut journal = journal_over(&backend);
            journal.append(1, b"a").unwrap();
            let clean_len = backend.data().len();

            let mut faulty = Journal::open(Box::new(FaultyBackend::new(&backend, fault))).unwrap();
            assert!(faulty.append(1, b"b").is_err());
            assert_eq!(backend.data().len(), clean_len);

            faulty.append(1, b"c").unwrap();
            let scan = journal_over(&backend).scan().unwrap();
            let payloads: Vec<_> = scan.entries.iter().map(|e| e.payload.clone()).collect();
            assert_eq!(payloads, vec![b"a".to_vec(), b"c".to_vec()]);
            assert_eq!(scan.torn_bytes, 0);
        }
    }

    #[test]
    fn failed_rollback_is_retried_before_the_next_append() {
        let backend = InMemoryBackend::new();
        journal_over(&backend).append(1, b"a").unwrap();

        let mut journal =
            Journal::open(Box::new(FaultyBackend::new(&backend, Fault::Stuck))).unwrap();
        assert!(journal.append(1, b"b").is_err());
        assert_eq!(journal.scan().unwrap().entries.len(), 1);

        journal.append(1, b"c").unwrap();
        let scan = journal_over(&backend).scan().unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[1].payload, b"c");
    }

    #[test]
    fn replace_rewrites_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.log");
        let mut journal = Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();

        for i in 0..10u8 {
            journal.append(1, &[i]).unwrap();
        }
        journal
            .replace(&[(1, vec![7]), (5, b"floor".to_vec())])
            .unwrap();
        drop(journal);

        let journal = Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        let scan = journal.scan().unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[0].payload, vec![7]);
        assert_eq!(scan.entries[1].kind, 5);
    }

    proptest! {
        #[test]
        fn any_truncation_keeps_a_valid_prefix(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..8),
            cut in any::<prop::sample::Index>(),
        ) {
            let mut bytes = Vec::new();
            for p in &payloads {
                bytes.extend_from_slice(&encode_frame(9, p).unwrap());
            }
            let cut_at = cut.index(bytes.len() + 1);
            bytes.truncate(cut_at);

            let journal = journal_over(&InMemoryBackend::with_data(bytes));
            let scan = journal.scan().unwrap();
            prop_assert!(scan.entries.len() <= payloads.len());
            for (entry, expected) in scan.entries.iter().zip(&payloads) {
                prop_assert_eq!(&entry.payload, expected);
            }
            prop_assert_eq!(scan.valid_len + scan.torn_bytes, cut_at as u64);
        }
    }
}
