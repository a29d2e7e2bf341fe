//! Verify command implementation.

use super::SyncDir;
use fieldsync_engine::{operations_path, queue_record_name, resources_path, store_record_name};
use fieldsync_storage::{FileBackend, Journal};
use std::path::Path;

/// Verification result for one journal.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of valid records.
    pub valid_records: usize,
    /// Bytes of a torn final record.
    pub torn_bytes: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, replay: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying data directory at {:?}", path);
    println!();

    let journals: [(&str, _, fn(u8) -> &'static str); 2] = [
        ("operations.log", operations_path(path), queue_record_name),
        ("resources.log", resources_path(path), store_record_name),
    ];

    let mut ok = true;
    for (name, journal_path, kind_name) in journals {
        if !journal_path.exists() {
            println!("{} not found (this may be normal for a new device)", name);
            continue;
        }
        println!("Checking {}...", name);
        let result = verify_journal(&journal_path, kind_name)?;
        print_result(name, &result);
        ok &= result.is_ok();
    }

    if ok && replay {
        println!("Replaying journals...");
        match SyncDir::open(path) {
            Ok(sync_dir) => println!(
                "  {} queued operations, {} cached resources",
                sync_dir.queue.size(),
                sync_dir.store.len()
            ),
            Err(e) => {
                println!("  replay failed: {}", e);
                ok = false;
            }
        }
    }

    println!();
    if ok {
        println!("✓ Data directory verification passed");
        Ok(())
    } else {
        println!("✗ Data directory verification failed");
        Err("Verification failed".into())
    }
}

fn verify_journal(
    path: &Path,
    kind_name: fn(u8) -> &'static str,
) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let journal = Journal::open(Box::new(FileBackend::open(path)?))?;
    let mut result = VerifyResult::default();

    let scan = match journal.scan() {
        Ok(scan) => scan,
        Err(e) => {
            result.errors.push(e.to_string());
            return Ok(result);
        }
    };

    for entry in &scan.entries {
        if kind_name(entry.kind) == "unknown" {
            result.errors.push(format!(
                "unknown record kind {} at offset {}",
                entry.kind, entry.offset
            ));
        } else {
            result.valid_records += 1;
        }
    }
    result.torn_bytes = scan.torn_bytes;
    Ok(result)
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {} valid records", result.valid_records);
    if result.torn_bytes > 0 {
        println!(
            "  {} bytes of an interrupted write at the end (dropped on next open)",
            result.torn_bytes
        );
    }
    for error in &result.errors {
        println!("  {}: {}", name, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_engine::{OperationInput, Record};
    use std::io::Write;

    fn populated() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let sync_dir = SyncDir::open_or_create(dir.path());
        sync_dir
            .queue
            .enqueue(OperationInput::create("inspection", "temp-1", Record::new()))
            .unwrap();
        dir
    }

    #[test]
    fn clean_directory_passes() {
        let dir = populated();
        run(dir.path(), true).unwrap();
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = populated();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(operations_path(dir.path()))
            .unwrap();
        file.write_all(b"FSJR\x01").unwrap();
        drop(file);

        let result = verify_journal(&operations_path(dir.path()), queue_record_name).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.torn_bytes, 5);
    }

    #[test]
    fn damaged_record_fails() {
        let dir = populated();
        let path = operations_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        bytes.extend_from_slice(&bytes.clone());
        std::fs::write(&path, bytes).unwrap();

        assert!(run(dir.path(), false).is_err());
    }
}
