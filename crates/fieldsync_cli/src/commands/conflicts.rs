//! Conflicts command implementation.

use super::SyncDir;
use fieldsync_engine::{Conflict, Rejection};
use serde::Serialize;
use std::path::Path;

/// Everything waiting on a person.
#[derive(Debug, Serialize)]
pub struct AttentionReport {
    /// Conflicts awaiting a resolution.
    pub conflicts: Vec<Conflict>,
    /// Rejections awaiting acknowledgement.
    pub rejections: Vec<Rejection>,
}

/// Runs the conflicts command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sync_dir = SyncDir::open(path)?;
    let report = AttentionReport {
        conflicts: sync_dir.queue.conflicts(),
        rejections: sync_dir.queue.rejections(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => print_text_output(&report)?,
    }
    Ok(())
}

fn print_text_output(report: &AttentionReport) -> Result<(), Box<dyn std::error::Error>> {
    if report.conflicts.is_empty() && report.rejections.is_empty() {
        println!("Nothing needs attention");
        return Ok(());
    }

    for conflict in &report.conflicts {
        println!("Conflict {} on {}", conflict.conflict_id, conflict.key);
        println!(
            "  {} based on version {}, server is at {}",
            conflict.kind,
            version_label(conflict.base_version),
            version_label(conflict.remote_version)
        );
        println!("  fields: {}", conflict.conflicting_fields.join(", "));
        println!("  local:  {}", serde_json::to_string(&conflict.local_payload)?);
        println!("  remote: {}", serde_json::to_string(&conflict.remote_payload)?);
    }

    for rejection in &report.rejections {
        println!(
            "Rejected {} of {}: {}",
            rejection.kind, rejection.key, rejection.reason
        );
    }
    Ok(())
}

fn version_label(version: Option<fieldsync_engine::Version>) -> String {
    version.map_or_else(|| "none".to_string(), |v| v.to_string())
}
