//! CLI argument parsing for diverdown

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for recorded definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "diverdown")]
#[command(version)]
#[command(about = "Replay a program under a method call tracer and print module dependencies", long_about = None)]
pub struct Cli {
    /// Tracer configuration (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Filter event kinds to trace (e.g., -e trace=call,return or -e trace=c)
    #[arg(short = 'e', long = "expr", value_name = "EXPR")]
    pub filter: Option<String>,

    /// Title of the recorded definition
    #[arg(long = "title", value_name = "TITLE")]
    pub title: Option<String>,

    /// Definition group of the recorded definition
    #[arg(long = "group", value_name = "GROUP")]
    pub group: Option<String>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Program script (JSON) to replay
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,
}
