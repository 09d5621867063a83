//! CLI parse: clap types for cosync. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cosync CLI - drive a sync server from scripted client messages
#[derive(Parser)]
#[command(name = "cosync")]
#[command(about = "Continuous queries and shared contexts over an in-memory transport")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (for config/ lookup)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Disable colored output
    #[arg(long, default_value = "false")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a JSON-lines script of client messages against the demo catalog
    Replay {
        /// Script path; one `{"connection": ..., "message": {...}}` per line
        script: PathBuf,
    },
    /// Run the built-in walkthrough scenarios
    Demo,
}
