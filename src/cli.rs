//! Command-line interface for micwatch
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wakeword and end-of-utterance monitor for networked microphones
#[derive(Parser, Debug)]
#[command(
    name = "micwatch",
    version,
    about = "Wakeword and end-of-utterance monitor for networked microphones"
)]
pub struct Cli {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Monitor every configured device until interrupted
    Run {
        /// Only monitor the device with this id (repeatable)
        #[arg(long = "device", value_name = "ID")]
        devices: Vec<String>,
    },

    /// Validate the configuration and print the resolved devices
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_command() {
        let cli = Cli::try_parse_from(["micwatch"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert_eq!(cli.verbose, 0);
        assert!(!cli.json);
    }

    #[test]
    fn test_parse_verbose_double() {
        let cli = Cli::try_parse_from(["micwatch", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_run_with_devices() {
        let cli = Cli::try_parse_from([
            "micwatch", "run", "--device", "kitchen", "--device", "hall", "--json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run { devices }) => assert_eq!(devices, vec!["kitchen", "hall"]),
            other => panic!("Expected Run, got {other:?}"),
        }
        assert!(cli.json);
    }

    #[test]
    fn test_parse_check_config_with_global_config() {
        let cli = Cli::try_parse_from(["micwatch", "check-config", "--config", "/tmp/m.toml"])
            .unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/m.toml")));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["micwatch", "transcribe"]).is_err());
    }
}
