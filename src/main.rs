//! CDC interceptor CLI
//!
#![doc = "CDC interceptor - filters change events and dispatches them to scenarios"]
#![doc = "Main entry point for the cdc-interceptor application."]

use anyhow::Result;

use cdc_interceptor::cli::{Cli, Commands};
use cdc_interceptor::commands;
use cdc_interceptor::config::Config;
use cdc_interceptor::logging::init_logging;
use cdc_interceptor::telemetry::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Initialize tracing with the merged logging settings
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run {
            mock,
            status_interval_secs,
        } => {
            config.validate()?;
            init_metrics_exporter();
            tracing::info!("Starting interceptor from {}", config_path);
            if mock {
                tracing::debug!("Mock mode: in-memory broker with synthetic feeds");
            }
            commands::run::run_pipeline(config, mock, status_interval_secs).await?;
            Ok(())
        }
        Commands::Validate => {
            tracing::info!("Validating configuration {}", config_path);
            commands::validate::validate_config(&config).await?;
            Ok(())
        }
        Commands::Scenarios => {
            commands::scenarios::list_scenarios();
            Ok(())
        }
    }
}
