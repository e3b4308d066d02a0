//! CLI argument definitions
//!
//! All Clap derive structs for `toolhost` command-line parsing.

use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::observability::LogFormat;

// ============================================================================
// Root CLI
// ============================================================================

/// Protocol host for editor-facing tooling services.
#[derive(Parser, Debug)]
#[command(name = "toolhost", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "TOOLHOST_COLOR")]
    pub color: ColorChoice,

    /// Log output format.
    #[arg(long, default_value = "human", global = true, env = "TOOLHOST_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the protocol over standard input and output.
    Serve(ServeArgs),

    /// Display version information.
    Version(VersionArgs),
}

// ============================================================================
// Serve Command
// ============================================================================

/// Arguments for `serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Expose Prometheus metrics on this port.
    #[arg(long, env = "TOOLHOST_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Timeout for requests sent to the client (e.g. `30s`). Waits
    /// indefinitely when unset.
    #[arg(long, env = "TOOLHOST_REQUEST_TIMEOUT", value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Grace period for in-flight handlers once the session ends.
    #[arg(
        long,
        default_value = "5s",
        env = "TOOLHOST_DRAIN_TIMEOUT",
        value_parser = humantime::parse_duration
    )]
    pub drain_timeout: Duration,

    /// Server name reported to the client.
    #[arg(long, env = "TOOLHOST_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Reject messages whose `jsonrpc` member is missing.
    #[arg(long, env = "TOOLHOST_STRICT_VERSION")]
    pub strict_version: bool,
}

// ============================================================================
// Version
// ============================================================================

/// Arguments for version display.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Output format for structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

// ============================================================================
// Tests
// ============================================================================
