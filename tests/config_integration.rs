//! Integration tests for configuration loading and validation
//!
//! This test suite validates:
//! - The shipped sample configuration parses and validates
//! - Environment and CLI overrides on top of a file
//! - The validate command instantiates every configured scenario

mod common;

use serial_test::serial;

use cdc_interceptor::cli::Cli;
use cdc_interceptor::commands::validate::validate_config;
use cdc_interceptor::config::{BrokerMode, Config};

use common::temp_config_file;

fn sample_path() -> String {
    format!("{}/config/config.yaml", env!("CARGO_MANIFEST_DIR"))
}

#[tokio::test]
#[serial]
async fn test_sample_config_is_valid() {
    let config = Config::load(&sample_path(), &Cli::default()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.interceptor.entities.len(), 2);
    let orders = config.interceptor.entity("orders").unwrap();
    assert_eq!(orders.scenarios.len(), 2);
    assert!(orders.has_test_mode());

    validate_config(&config).await.unwrap();
}

#[test]
#[serial]
fn test_env_and_cli_overrides() {
    let (_dir, path) = temp_config_file(
        r#"
broker:
  mode: kafka
  brokers: file-broker:9092
interceptor:
  entities:
    - name: orders
      topic: orders-topic
"#,
    );

    std::env::set_var("INTERCEPTOR_BROKER_MODE", "memory");
    std::env::set_var("INTERCEPTOR_WORKER_POOL_SIZE", "3");
    let cli = Cli {
        brokers: Some("cli-broker:9092".to_string()),
        verbose: true,
        ..Cli::default()
    };
    let config = Config::load(path.to_str().unwrap(), &cli);
    std::env::remove_var("INTERCEPTOR_BROKER_MODE");
    std::env::remove_var("INTERCEPTOR_WORKER_POOL_SIZE");

    let config = config.unwrap();
    assert_eq!(config.broker.mode, BrokerMode::Memory);
    assert_eq!(config.broker.brokers, "cli-broker:9092");
    assert_eq!(config.decide.worker_pool_size, 3);
    assert_eq!(config.logging.level, "debug");
}

#[tokio::test]
#[serial]
async fn test_validate_reports_missing_request_topic() {
    let (_dir, path) = temp_config_file(
        r#"
interceptor:
  entities:
    - name: orders
      topic: orders-topic
      scenarios:
        - name: engine
          type: request_reply
          params:
            response_topic: engine-responses
"#,
    );
    let config = Config::load(path.to_str().unwrap(), &Cli::default()).unwrap();
    let err = validate_config(&config).await.unwrap_err();
    assert!(err.to_string().contains("engine"));
}
