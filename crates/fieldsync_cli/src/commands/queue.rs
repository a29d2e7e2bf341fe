//! Queue command implementation.

use super::SyncDir;
use fieldsync_engine::Operation;
use serde::Serialize;
use std::path::Path;

/// One row of the queue listing.
#[derive(Debug, Serialize)]
pub struct QueueRow {
    /// Position in the queue.
    pub seq: u64,
    /// Operation id.
    pub operation_id: String,
    /// Create, update or delete.
    pub kind: String,
    /// `type:id` of the target resource.
    pub key: String,
    /// Lifecycle label.
    pub status: String,
    /// Version the operation was formed against.
    pub base_version: Option<u64>,
    /// Failed attempts.
    pub attempts: u32,
    /// Last failure.
    pub last_error: Option<String>,
    /// Earliest next attempt, in milliseconds since the epoch.
    pub next_attempt_at: Option<u64>,
}

impl From<&Operation> for QueueRow {
    fn from(op: &Operation) -> Self {
        Self {
            seq: op.seq,
            operation_id: op.operation_id.to_string(),
            kind: op.kind.to_string(),
            key: op.key().to_string(),
            status: op.status.label().to_string(),
            base_version: op.base_version.map(|v| v.0),
            attempts: op.attempt_count,
            last_error: op.last_error.clone(),
            next_attempt_at: op.next_attempt_at,
        }
    }
}

/// Runs the queue command.
pub fn run(
    path: &Path,
    all: bool,
    resource_type: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let sync_dir = SyncDir::open(path)?;
    let rows = rows(&sync_dir.queue.operations(), all, resource_type);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            if rows.is_empty() {
                println!("Queue is empty");
            }
            for row in &rows {
                println!(
                    "{:>6}  {:<10} {:<7} {:<40} base={} attempts={}",
                    row.seq,
                    row.status,
                    row.kind,
                    row.key,
                    row.base_version
                        .map_or_else(|| "-".to_string(), |v| v.to_string()),
                    row.attempts
                );
                if let Some(error) = &row.last_error {
                    println!("        last error: {}", error);
                }
            }
        }
    }

    Ok(())
}

fn rows(operations: &[Operation], all: bool, resource_type: Option<&str>) -> Vec<QueueRow> {
    operations
        .iter()
        .filter(|op| all || !op.is_terminal() || op.status.label() == "conflicted")
        .filter(|op| resource_type.map_or(true, |t| op.resource_type == t))
        .map(QueueRow::from)
        .collect()
}
