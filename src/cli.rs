//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Clauth - local credential-brokering daemon for untrusted skills
#[derive(Parser, Debug)]
#[command(name = "clauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CLAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Vault passphrase (prefer the environment over the flag)
    #[arg(long, env = "CLAUTH_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CLAUTH_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CLAUTH_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand; defaults to serving the daemon
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Daemon subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon (default)
    Serve,
    /// Verify the audit log hash chain and exit
    VerifyAudit,
}
