//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Support Gateway - agent chat proxy with a shared access-token cache
#[derive(Parser, Debug)]
#[command(name = "support-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SUPPORT_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SUPPORT_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SUPPORT_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SUPPORT_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SUPPORT_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Fetch one agent access token and report its expiry (token is redacted)
    Token,

    /// Query the search backend once and print ticket counts
    Tickets {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}
