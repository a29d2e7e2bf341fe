//! Compact command implementation.

use super::{file_size, format_size, SyncDir};
use std::path::Path;
use tracing::info;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let sync_dir = SyncDir::open(path)?;
    let queue = &sync_dir.queue;
    let store = &sync_dir.store;
    let operations_path = sync_dir.dir.operations_path();
    let resources_path = sync_dir.dir.resources_path();

    let settled = queue
        .operations()
        .iter()
        .filter(|op| matches!(op.status.label(), "applied" | "rejected"))
        .count();

    println!("Compacting {:?}", path);
    println!(
        "  operations.log: {} records, {}",
        queue.journal_records(),
        format_size(file_size(&operations_path))
    );
    println!(
        "  resources.log:  {} records, {}",
        store.journal_records(),
        format_size(file_size(&resources_path))
    );
    println!("  settled operations to prune: {}", settled);

    if dry_run {
        println!();
        println!("Dry run - no changes made");
        return Ok(());
    }

    let pruned = queue.prune()?;
    queue.compact()?;
    store.compact()?;
    info!(pruned, "journals compacted");

    println!();
    println!(
        "  operations.log: {} records, {}",
        queue.journal_records(),
        format_size(file_size(&operations_path))
    );
    println!(
        "  resources.log:  {} records, {}",
        store.journal_records(),
        format_size(file_size(&resources_path))
    );
    Ok(())
}
