//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Use simulated GPIO lines (SIGUSR1/SIGUSR2 toggle the inputs)
    #[arg(short, long)]
    pub simulate: bool,
}

/// Setup command arguments.
#[derive(Debug, Args)]
pub struct SetupCommand {
    /// Configure simulated lines instead of the hardware
    #[arg(short, long)]
    pub simulate: bool,
}

/// Probe command arguments.
#[derive(Debug, Args)]
pub struct ProbeCommand {
    /// Probe simulated lines instead of the hardware
    #[arg(short, long)]
    pub simulate: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Send command arguments.
#[derive(Debug, Args)]
pub struct SendCommand {
    /// Log files or directories to send
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Send files the ledger already records as sent
    #[arg(short, long)]
    pub force: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Ledger commands.
#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    /// List the most recently sent logs
    Recent {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show ledger statistics
    Stats {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        file: Option<PathBuf>,
    },
}
