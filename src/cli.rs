//! CLI argument parsing for the demonstration binary.

use clap::Parser;
use std::path::PathBuf;

/// Exercise the durable file I/O engine end-to-end against a real path.
#[derive(Parser, Debug)]
#[command(name = "durafile")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path of the file to create (must not already exist)
    #[arg(value_name = "PATH")]
    pub target: PathBuf,

    /// Total size to pre-allocate, in bytes
    #[arg(short = 's', long, default_value_t = 4 * 1024 * 1024)]
    pub size: u64,

    /// Size of each appended record, in bytes
    #[arg(short = 'r', long, default_value_t = 4096)]
    pub record_size: usize,

    /// Number of records to append
    #[arg(short = 'n', long, default_value_t = 16)]
    pub count: usize,

    /// Number of writes the engine may have in flight at once
    #[arg(short = 'q', long, default_value_t = 4)]
    pub max_writes: usize,

    /// Request O_DIRECT if the target filesystem supports it
    #[arg(long)]
    pub direct: bool,

    /// Print per-step timing and engine diagnostics to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
