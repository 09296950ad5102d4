//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::parse_duration;

/// Verigate - identity and access-control core
#[derive(Parser, Debug)]
#[command(name = "verigate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VERIGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "VERIGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "VERIGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VERIGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VERIGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Mint a locally signed token with the configured secret
    IssueToken {
        /// Principal id to put in `sub`
        #[arg(long)]
        principal: u64,

        /// Token lifetime (e.g. `15m`, `1h`); defaults to `local.token_ttl`
        #[arg(long, value_parser = parse_duration)]
        ttl: Option<Duration>,
    },

    /// Load and validate configuration, then print a summary
    CheckConfig,
}
