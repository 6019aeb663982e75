//! CLI argument parsing for megatrace-capture

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Default address the capture tool listens on
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8086";

/// Output format for captured events
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON lines for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "megatrace-capture")]
#[command(version)]
#[command(about = "Receive and print a MEGATrace event stream", long_about = None)]
pub struct Cli {
    /// Address to accept bridge connections on
    #[arg(
        short,
        long,
        value_name = "ADDR",
        default_value = DEFAULT_LISTEN,
        conflicts_with = "input"
    )]
    pub listen: String,

    /// Read a recorded stream from a file instead of listening
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Exit after the first connection closes
    #[arg(long)]
    pub once: bool,

    /// Only print the per-kind summary
    #[arg(short = 'c', long = "summary")]
    pub summary_only: bool,

    /// Enable debug logging to stderr
    #[arg(long)]
    pub debug: bool,
}
