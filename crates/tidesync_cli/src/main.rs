//! tidesync CLI
//!
//! Command-line tools for the offline queue log a sync coordinator keeps
//! on disk.
//!
//! # Commands
//!
//! - `inspect` - Display queue statistics
//! - `verify` - Check every frame of the log
//! - `compact` - Rewrite the log with only the live operations
//! - `dump` - Dump log frames for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tidesync offline queue tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue log file
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
    /// Display queue statistics
    Inspect {
        /// Break live operations down by table
        #[arg(short, long)]
        tables: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify every frame of the log
    Verify,

    /// Rewrite the log with only the live operations
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump log frames for debugging
    Dump {
        /// Maximum number of frames to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only dump the live queue, not every frame
        #[arg(long)]
        live: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { tables, format } => {
            let path = cli.path.ok_or("Queue log path required for inspect")?;
            commands::inspect::run(&path, tables, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Queue log path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Queue log path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Dump {
            limit,
            live,
            format,
        } => {
            let path = cli.path.ok_or("Queue log path required for dump")?;
            commands::dump::run(&path, limit, live, &format)?;
        }
        Commands::Version => {
            println!("tidesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("tidesync core v{}", tidesync_core::VERSION);
        }
    }

    Ok(())
}
