//! Inspect command implementation.

use super::{file_size, format_size, SyncDir};
use fieldsync_engine::Timestamp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Operation journal size in bytes.
    pub operations_size: u64,
    /// Resource journal size in bytes.
    pub resources_size: u64,
    /// Records in the operation journal.
    pub operation_records: usize,
    /// Records in the resource journal.
    pub resource_records: usize,
    /// Operations awaiting submission.
    pub pending: usize,
    /// Pending operations per resource type.
    pub pending_by_type: BTreeMap<String, usize>,
    /// Operations that failed at least once.
    pub retrying: usize,
    /// Pending conflicts.
    pub conflicts: usize,
    /// Unacknowledged rejections.
    pub rejections: usize,
    /// Cached resources.
    pub cached_resources: usize,
    /// Cached resources with queued local changes.
    pub locally_modified: usize,
    /// Last completed sync, in milliseconds since the epoch.
    pub last_sync_at: Option<Timestamp>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sync_dir = SyncDir::open(path)?;
    let queue = &sync_dir.queue;
    let store = &sync_dir.store;

    let entries = store.entries();
    let result = InspectResult {
        path: path.display().to_string(),
        operations_size: file_size(&sync_dir.dir.operations_path()),
        resources_size: file_size(&sync_dir.dir.resources_path()),
        operation_records: queue.journal_records(),
        resource_records: store.journal_records(),
        pending: queue.size(),
        pending_by_type: queue.pending_by_type(),
        retrying: queue
            .operations()
            .iter()
            .filter(|op| !op.is_terminal() && op.attempt_count > 0)
            .count(),
        conflicts: queue.conflicts().len(),
        rejections: queue.rejections().len(),
        cached_resources: entries.len(),
        locally_modified: entries.iter().filter(|e| e.has_local_changes()).count(),
        last_sync_at: store.last_sync_at(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("fieldsync Data Directory");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Journals:");
    println!(
        "  operations.log: {} ({} records)",
        format_size(result.operations_size),
        result.operation_records
    );
    println!(
        "  resources.log:  {} ({} records)",
        format_size(result.resources_size),
        result.resource_records
    );
    println!();
    println!("Queue:");
    println!("  Pending:    {}", result.pending);
    for (resource_type, count) in &result.pending_by_type {
        println!("    {:<20} {}", resource_type, count);
    }
    println!("  Retrying:   {}", result.retrying);
    println!("  Conflicts:  {}", result.conflicts);
    println!("  Rejections: {}", result.rejections);
    println!();
    println!("Cache:");
    println!("  Resources:        {}", result.cached_resources);
    println!("  Locally modified: {}", result.locally_modified);
    match result.last_sync_at {
        Some(at) => println!("  Last sync:        {} ms", at),
        None => println!("  Last sync:        never"),
    }
}
