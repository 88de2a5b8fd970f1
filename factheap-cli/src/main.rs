//! factheap CLI - operator tooling for dependency snapshots and region layouts.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// factheap - shared-memory fact store tooling.
#[derive(Parser)]
#[command(name = "factheap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a flat dependency blob
    InspectBlob {
        /// Path to the blob file
        file: PathBuf,
    },

    /// Load a flat blob into a scratch region and save it as SQLite
    Convert {
        /// Path to the blob file
        blob: PathBuf,

        /// Path of the SQLite database to write
        db: PathBuf,

        /// Build identifier stamped into the database header
        #[arg(long)]
        build_info: String,

        /// log2 of the scratch dependency table size
        #[arg(long, default_value = "22")]
        dep_table_pow: u32,

        /// Merge into an existing database instead of creating a new one
        #[arg(long)]
        merge: bool,
    },

    /// Print the stored edges of one vertex
    Query {
        /// Path to the SQLite database
        db: PathBuf,

        /// Key vertex
        vertex: u32,

        /// Accept a database written by any build
        #[arg(long)]
        ignore_version: bool,

        /// Build identifier the database must match
        #[arg(long, required_unless_present = "ignore_version")]
        build_info: Option<String>,
    },

    /// Print the section offsets a configuration produces
    Layout {
        /// JSON region configuration (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::InspectBlob { file } => commands::inspect::run(&file),
        Commands::Convert {
            blob,
            db,
            build_info,
            dep_table_pow,
            merge,
        } => commands::convert::run(&blob, &db, &build_info, dep_table_pow, merge),
        Commands::Query {
            db,
            vertex,
            ignore_version,
            build_info,
        } => commands::query::run(&db, vertex, ignore_version, build_info),
        Commands::Layout { config } => commands::layout::run(config.as_deref()),
    }
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Respect RUST_LOG if set
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string());
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("FACTHEAP_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr).flatten_event(true))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }
    Ok(())
}
