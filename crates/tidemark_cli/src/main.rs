//! TIDEMARK CLI
//!
//! Inspect, dump, and verify boundary trace files.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "TIDEMARK - WebAssembly boundary trace tools", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header, string table, type maps, and summary
    Inspect {
        /// Path to trace file
        file: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List events
    Dump {
        /// Path to trace file
        file: PathBuf,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
        /// Stop after this many events
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Check that a trace parses and is balanced
    Verify {
        /// Path to trace file
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tidemark=debug" } else { "tidemark=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut out = io::stdout().lock();
    match cli.command {
        Commands::Inspect { file, json } => {
            let trace = commands::load(&file)?;
            commands::inspect(&trace, json, &mut out)
        }
        Commands::Dump { file, json, limit } => {
            let trace = commands::load(&file)?;
            commands::dump(&trace, json, limit, &mut out)
        }
        Commands::Verify { file } => commands::verify(&file, &mut out),
    }
}
