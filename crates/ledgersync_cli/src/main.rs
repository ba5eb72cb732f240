//! ledgersync CLI
//!
//! Offline operator tools for ledgersync record batches.
//!
//! # Commands
//!
//! - `verify` - Verify a record batch against the rule table
//! - `conflicts` - Compare a local and a remote batch
//! - `resolve` - Record a resolution decision for one conflict
//! - `rules` - List the verification rule table
//! - `report` - Verify, compare and export a reconciliation report
//! - `settings` - Show the effective settings of a settings file

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ledgersync command-line tools.
#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a JSON array of records
    Verify {
        /// Entity type of the batch (e.g. Ledger, Group, StockItem)
        #[arg(short, long)]
        entity_type: String,

        /// Path to the JSON batch
        #[arg(short, long)]
        input: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Compare local and remote batches by stable id
    Conflicts {
        /// Entity type of both batches
        #[arg(short, long)]
        entity_type: String,

        /// Batch extracted from the accounting engine
        #[arg(short, long)]
        local: PathBuf,

        /// Batch held by the backend
        #[arg(short, long)]
        remote: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Record a resolution decision for one conflict
    Resolve {
        /// Entity type of both batches
        #[arg(short, long)]
        entity_type: String,

        /// Batch extracted from the accounting engine
        #[arg(short, long)]
        local: PathBuf,

        /// Batch held by the backend
        #[arg(short, long)]
        remote: PathBuf,

        /// Stable id of the conflicting record
        #[arg(long)]
        id: String,

        /// Strategy (useLocal, useRemote, merge, skip)
        #[arg(short, long)]
        strategy: String,
    },

    /// List the verification rule table
    Rules,

    /// Verify and compare batches, then export a report document
    Report {
        /// Entity type of both batches
        #[arg(short, long)]
        entity_type: String,

        /// Batch extracted from the accounting engine
        #[arg(short, long)]
        local: PathBuf,

        /// Batch held by the backend, if any
        #[arg(short, long)]
        remote: Option<PathBuf>,

        /// Directory to write the report into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Show the effective settings of a settings file
    Settings {
        /// Path to the settings JSON (defaults are shown without one)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    // stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Verify {
            entity_type,
            input,
            format,
        } => {
            commands::verify::run(&entity_type, &input, &format)?;
        }
        Commands::Conflicts {
            entity_type,
            local,
            remote,
            format,
        } => {
            commands::conflicts::run(&entity_type, &local, &remote, &format)?;
        }
        Commands::Resolve {
            entity_type,
            local,
            remote,
            id,
            strategy,
        } => {
            commands::conflicts::resolve(&entity_type, &local, &remote, &id, &strategy)?;
        }
        Commands::Rules => {
            commands::rules::run();
        }
        Commands::Report {
            entity_type,
            local,
            remote,
            output,
        } => {
            commands::report::run(&entity_type, &local, remote.as_deref(), &output)?;
        }
        Commands::Settings { file } => {
            commands::settings::run(file.as_deref())?;
        }
        Commands::Version => {
            println!("ledgersync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
