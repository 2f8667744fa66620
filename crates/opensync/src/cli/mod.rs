//! Command-line interface for opensync.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, LedgerCommand, ProbeCommand, RunCommand, SendCommand, SetupCommand,
    StatusCommand,
};

/// opensync - UPS power sequencing and flight-log sync for a flight computer
///
/// Watches the UPS HAT's power lines, keeps the host-alive heartbeat driven,
/// and drains pending log uploads before the UPS cuts power.
#[derive(Debug, Parser)]
#[command(name = "opensync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the power sequencer, sync pipeline and shutdown coordinator
    Run(RunCommand),

    /// Configure the UPS lines and exit (run once at boot)
    Setup(SetupCommand),

    /// Sample the UPS lines and probe for a battery
    Probe(ProbeCommand),

    /// Show the running daemon's status
    Status(StatusCommand),

    /// Send flight logs now, without the daemon
    Send(SendCommand),

    /// Inspect the ledger of sent logs
    #[command(subcommand)]
    Ledger(LedgerCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_name() {
        assert_eq!(Cli::command().get_name(), "opensync");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity() {
        use crate::logging::Verbosity;

        assert_eq!(parse(&["opensync", "status"]).verbosity(), Verbosity::Normal);
        assert_eq!(parse(&["opensync", "-v", "status"]).verbosity(), Verbosity::Verbose);
        assert_eq!(parse(&["opensync", "-vv", "status"]).verbosity(), Verbosity::Trace);
        assert_eq!(parse(&["opensync", "-q", "-v", "status"]).verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_parse_run() {
        let cli = parse(&["opensync", "run"]);
        assert!(matches!(cli.command, Command::Run(RunCommand { simulate: false })));

        let cli = parse(&["opensync", "run", "--simulate"]);
        assert!(matches!(cli.command, Command::Run(RunCommand { simulate: true })));
    }

    #[test]
    fn test_parse_setup() {
        let cli = parse(&["opensync", "setup"]);
        assert!(matches!(cli.command, Command::Setup(_)));
    }

    #[test]
    fn test_parse_probe_json() {
        let cli = parse(&["opensync", "probe", "--json", "-s"]);
        assert!(matches!(
            cli.command,
            Command::Probe(ProbeCommand {
                simulate: true,
                json: true
            })
        ));
    }

    #[test]
    fn test_parse_status() {
        let cli = parse(&["opensync", "status", "-j"]);
        assert!(matches!(cli.command, Command::Status(StatusCommand { json: true })));
    }

    #[test]
    fn test_parse_send() {
        let cli = parse(&["opensync", "send", "/var/log/flights", "LOG_JFK_1.log", "--force"]);
        match cli.command {
            Command::Send(cmd) => {
                assert_eq!(
                    cmd.paths,
                    vec![PathBuf::from("/var/log/flights"), PathBuf::from("LOG_JFK_1.log")]
                );
                assert!(cmd.force);
                assert!(!cmd.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_send_requires_a_path() {
        assert!(Cli::try_parse_from(["opensync", "send"]).is_err());
        assert!(Cli::try_parse_from(["opensync", "send", "--force"]).is_err());
    }

    #[test]
    fn test_parse_ledger() {
        let cli = parse(&["opensync", "ledger", "recent"]);
        assert!(matches!(
            cli.command,
            Command::Ledger(LedgerCommand::Recent {
                limit: 20,
                json: false
            })
        ));

        let cli = parse(&["opensync", "ledger", "recent", "-n", "5", "-j"]);
        assert!(matches!(
            cli.command,
            Command::Ledger(LedgerCommand::Recent { limit: 5, json: true })
        ));

        let cli = parse(&["opensync", "ledger", "stats", "--json"]);
        assert!(matches!(cli.command, Command::Ledger(LedgerCommand::Stats { json: true })));
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = parse(&["opensync", "config", "validate", "/tmp/opensync.toml"]);
        match cli.command {
            Command::Config(ConfigCommand::Validate { file }) => {
                assert_eq!(file, Some(PathBuf::from("/tmp/opensync.toml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_with_config() {
        let cli = parse(&["opensync", "run", "-c", "/etc/opensync/config.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/opensync/config.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["opensync"]).is_err());
    }
}
