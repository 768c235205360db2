//! Command-line interface definition for the CDC interceptor
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the pipeline, validate a configuration,
//! and list the registered scenario types.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CDC interceptor - filter change events and dispatch them to scenarios
#[derive(Parser, Debug, Clone)]
#[command(name = "cdc-interceptor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the Kafka bootstrap servers
    #[arg(long, env = "INTERCEPTOR_BROKERS")]
    pub brokers: Option<String>,

    /// Emit JSON-formatted logs
    #[arg(long)]
    pub json_logs: bool,

    /// Additional log file (appended to)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the filter/decide pipeline
    Run {
        /// Use the in-memory broker with synthetic events instead of Kafka
        #[arg(long)]
        mock: bool,

        /// Log a status report every N seconds (0 disables)
        #[arg(long, default_value_t = 60)]
        status_interval_secs: u64,
    },

    /// Validate the configuration and scenario definitions, then exit
    Validate,

    /// List registered scenario types
    Scenarios,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            brokers: None,
            json_logs: false,
            log_file: None,
            command: Commands::Validate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/config.yaml".to_string()));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_cli_parse_run_defaults() {
        let cli = Cli::try_parse_from(["cdc-interceptor", "run"]).unwrap();
        if let Commands::Run {
            mock,
            status_interval_secs,
        } = cli.command
        {
            assert!(!mock);
            assert_eq!(status_interval_secs, 60);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_run_mock() {
        let cli = Cli::try_parse_from([
            "cdc-interceptor",
            "run",
            "--mock",
            "--status-interval-secs",
            "0",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run {
                mock: true,
                status_interval_secs: 0
            }
        ));
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "cdc-interceptor",
            "--config",
            "custom.yaml",
            "--verbose",
            "--brokers",
            "kafka:9092",
            "--json-logs",
            "validate",
        ])
        .unwrap();
        assert_eq!(cli.config, Some("custom.yaml".to_string()));
        assert!(cli.verbose);
        assert_eq!(cli.brokers, Some("kafka:9092".to_string()));
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_cli_parse_scenarios() {
        let cli = Cli::try_parse_from(["cdc-interceptor", "scenarios"]).unwrap();
        assert!(matches!(cli.command, Commands::Scenarios));
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["cdc-interceptor"]).is_err());
    }
}
