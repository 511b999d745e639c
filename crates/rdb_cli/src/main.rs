//! RDB CLI
//!
//! Command-line driver for RDB databases.
//!
//! # Commands
//!
//! - `get` - Print the value stored under a key
//! - `set` - Store a value under a key
//! - `del` - Remove a key
//! - `rebuild` - Compact the files and apply new geometry
//! - `verify` - Check every on-disk invariant
//! - `inspect` - Display geometry and space usage

mod commands;

use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use commands::DbOptions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// RDB hash-indexed key/value store.
#[derive(Parser)]
#[command(name = "rdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Database name; files are named `<name>.*`
    #[arg(global = true, short, long, default_value = "rdb")]
    name: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Hash directory size for a new database or the next rebuild
    #[arg(global = true, long)]
    htsize: Option<u32>,

    /// Key page size for a new database or the next rebuild
    #[arg(global = true, long)]
    pgsize: Option<usize>,

    /// Value page size for a new database or the next rebuild
    #[arg(global = true, long)]
    vpsize: Option<usize>,

    /// Share of physical memory for the page arena and key page cache, in percent
    #[arg(global = true, long)]
    memusage: Option<u32>,

    /// Sync the value file after every write (0/1)
    #[arg(global = true, long, value_parser = BoolishValueParser::new())]
    syncdf: Option<bool>,

    /// Sync the key file after every write (0/1)
    #[arg(global = true, long, value_parser = BoolishValueParser::new())]
    syncif: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value stored under a key
    Get {
        /// Key to look up
        key: String,
    },

    /// Store a value under a key
    Set {
        /// Key to store
        key: String,

        /// Value to store
        value: String,
    },

    /// Remove a key
    Del {
        /// Key to remove
        key: String,
    },

    /// Rewrite the database into fresh files
    Rebuild,

    /// Verify database integrity
    Verify,

    /// Display database geometry and space usage
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("RDB CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("RDB Core v{}", rdb_core::VERSION);
        return Ok(());
    }

    let options = DbOptions {
        path: cli.path.ok_or("Database path required (--path)")?,
        name: cli.name,
        hash_table_size: cli.htsize,
        key_page_size: cli.pgsize,
        value_page_size: cli.vpsize,
        memory_usage_percent: cli.memusage,
        sync_data_file: cli.syncdf,
        sync_index_file: cli.syncif,
    };

    match cli.command {
        Commands::Get { key } => commands::kv::get(&options, &key)?,
        Commands::Set { key, value } => commands::kv::set(&options, &key, &value)?,
        Commands::Del { key } => commands::kv::del(&options, &key)?,
        Commands::Rebuild => commands::rebuild::run(&options)?,
        Commands::Verify => commands::verify::run(&options)?,
        Commands::Inspect { format } => commands::inspect::run(&options, &format)?,
        Commands::Version => {}
    }

    Ok(())
}
