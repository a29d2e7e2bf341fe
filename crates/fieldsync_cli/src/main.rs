//! fieldsync CLI
//!
//! Operator tools for a device's sync data directory.
//!
//! # Commands
//!
//! - `inspect` - Display queue, cache and journal statistics
//! - `queue` - List queued operations
//! - `conflicts` - List pending conflicts and rejections
//! - `verify` - Verify journal integrity
//! - `compact` - Prune settled operations and rewrite the journals

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fieldsync data directory tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue, cache and journal statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued operations
    Queue {
        /// Include applied and rejected operations not yet pruned
        #[arg(short, long)]
        all: bool,

        /// Only show this resource type
        #[arg(short = 't', long = "type")]
        resource_type: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending conflicts and unacknowledged rejections
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify {
        /// Also replay both journals (takes the directory lock)
        #[arg(short, long)]
        replay: bool,
    },

    /// Prune settled operations and rewrite the journals
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Data directory path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Queue {
            all,
            resource_type,
            format,
        } => {
            let path = cli.path.ok_or("Data directory path required for queue")?;
            commands::queue::run(&path, all, resource_type.as_deref(), &format)?;
        }
        Commands::Conflicts { format } => {
            let path = cli.path.ok_or("Data directory path required for conflicts")?;
            commands::conflicts::run(&path, &format)?;
        }
        Commands::Verify { replay } => {
            let path = cli.path.ok_or("Data directory path required for verify")?;
            commands::verify::run(&path, replay)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Data directory path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("fieldsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Journal format v{}",
                fieldsync_storage::JOURNAL_VERSION
            );
        }
    }

    Ok(())
}
