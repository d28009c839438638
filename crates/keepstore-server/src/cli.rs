//! Command-line interface for the keepstore binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keep block storage node.
#[derive(Debug, Parser)]
#[command(name = "keepstore")]
#[command(about = "Keep content-addressed block storage node", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "KEEPSTORE_CONFIG", default_value = "/etc/keepstore/keepstore.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, env = "KEEPSTORE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands; `serve` is the default.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Mount volumes and run background workers until interrupted.
    Serve,
    /// Load and validate the configuration, then print the mounts.
    CheckConfig,
    /// List available volume drivers.
    Drivers,
}

impl Cli {
    /// The selected subcommand.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}
