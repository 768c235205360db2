//! Configuration management for the CDC interceptor
//!
//! This module handles loading and validating configuration from
//! YAML files, environment variables (`INTERCEPTOR_*`), and CLI arguments.

use crate::error::{InterceptorError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker connection settings
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Entities and their scenarios
    #[serde(default)]
    pub interceptor: InterceptorConfig,

    /// Filter stage behavior
    #[serde(default)]
    pub filter: FilterConfig,

    /// Decide stage behavior
    #[serde(default)]
    pub decide: DecideConfig,

    /// Request/response correlation
    #[serde(default)]
    pub response: ResponseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which broker implementation backs the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// Kafka via rdkafka
    #[default]
    Kafka,
    /// In-process broker with synthetic feeds
    Memory,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Broker implementation
    #[serde(default)]
    pub mode: BrokerMode,

    /// Kafka brokers (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Client id reported to Kafka
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Offset reset policy for new consumer groups
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Longest a single poll waits for records
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on records returned by one poll
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Security configuration
    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,

    /// Confluent-compatible schema registry base URL
    #[serde(default)]
    pub schema_registry_url: Option<String>,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "cdc-interceptor".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_batch_size() -> usize {
    500
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            brokers: default_brokers(),
            client_id: default_client_id(),
            auto_offset_reset: default_auto_offset_reset(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            security: None,
            schema_registry_url: None,
        }
    }
}

/// Kafka security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password (prefer env var KAFKA_SASL_PASSWORD)
    #[serde(default)]
    pub sasl_password: Option<String>,

    /// CA certificate path
    #[serde(default)]
    pub ssl_ca_location: Option<String>,

    /// Client certificate path (mTLS)
    #[serde(default)]
    pub ssl_certificate_location: Option<String>,

    /// Client key path (mTLS)
    #[serde(default)]
    pub ssl_key_location: Option<String>,
}

/// The monitored entities
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InterceptorConfig {
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

impl InterceptorConfig {
    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}

/// One monitored entity (table) and its scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Entity name used for routing and storage
    #[serde(alias = "entity_name")]
    pub name: String,

    /// CDC topic carrying this entity's changes
    #[serde(alias = "topic_name")]
    pub topic: String,

    /// Consumer group id (defaults to `interceptor-<name>`)
    #[serde(default)]
    pub group_id: Option<String>,

    /// Maximum events kept in the history store
    #[serde(default = "default_max_messages_in_storage")]
    pub max_messages_in_storage: usize,

    /// Maximum age span of the history store, in minutes
    #[serde(default = "default_max_time_in_storage_mins")]
    pub max_time_in_storage_mins: u64,

    /// Interval between synthetic events in memory mode
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,

    /// Scenarios attached to this entity
    #[serde(default)]
    pub scenarios: Vec<ScenarioDefinition>,

    /// Synthetic feed publishes CREATED events (memory mode)
    #[serde(default)]
    pub test_creations: bool,

    /// Synthetic feed publishes CHANGED events (memory mode)
    #[serde(default)]
    pub test_changes: bool,

    /// Synthetic feed publishes DELETED events (memory mode)
    #[serde(default)]
    pub test_deletions: bool,
}

fn default_max_messages_in_storage() -> usize {
    10_000
}

fn default_max_time_in_storage_mins() -> u64 {
    30
}

fn default_processing_delay_ms() -> u64 {
    2000
}

impl EntityConfig {
    /// Creates an entity with default limits and no scenarios.
    pub fn new(name: &str, topic: &str) -> Self {
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            group_id: None,
            max_messages_in_storage: default_max_messages_in_storage(),
            max_time_in_storage_mins: default_max_time_in_storage_mins(),
            processing_delay_ms: default_processing_delay_ms(),
            scenarios: Vec::new(),
            test_creations: false,
            test_changes: false,
            test_deletions: false,
        }
    }

    pub fn with_scenario(mut self, definition: ScenarioDefinition) -> Self {
        self.scenarios.push(definition);
        self
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages_in_storage = max;
        self
    }

    pub fn with_processing_delay_ms(mut self, delay_ms: u64) -> Self {
        self.processing_delay_ms = delay_ms;
        self
    }

    pub fn group_id(&self) -> String {
        self.group_id
            .clone()
            .unwrap_or_else(|| format!("interceptor-{}", self.name))
    }

    pub fn max_time_in_storage(&self) -> Duration {
        Duration::from_secs(self.max_time_in_storage_mins * 60)
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// True when any synthetic event kind is enabled.
    pub fn has_test_mode(&self) -> bool {
        self.test_creations || self.test_changes || self.test_deletions
    }
}

/// Scenario definition: a name, a registered type and free-form params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub scenario_type: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ScenarioDefinition {
    pub fn new(name: &str, scenario_type: &str) -> Self {
        Self {
            name: name.to_string(),
            scenario_type: scenario_type.to_string(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Deserializes the params into a scenario-specific struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            InterceptorError::Config(format!("Invalid params for scenario '{}': {}", self.name, e))
                .into()
        })
    }
}

/// Filter stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Give up after this many consecutive collect failures (unset = never)
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,

    /// Pause after a failed collect
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
}

fn default_failure_backoff_ms() -> u64 {
    1000
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: None,
            failure_backoff_ms: default_failure_backoff_ms(),
        }
    }
}

/// Decide stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideConfig {
    /// Concurrent scenario invocations
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Shared queue bound (unset = unbounded)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Diagnostics cache capacity
    #[serde(default = "default_meta_cache_size")]
    pub meta_cache_size: usize,

    /// Wait per executor on shutdown before aborting
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_meta_cache_size() -> usize {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl DecideConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for DecideConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: None,
            meta_cache_size: default_meta_cache_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Request/response correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Pause while the response consumer is disconnected
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Field of a JSON key (or payload) holding the correlation key
    #[serde(default = "default_key_field")]
    pub key_field: String,

    /// Consumer group for response topics
    #[serde(default = "default_response_group_id")]
    pub group_id: String,
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_key_field() -> String {
    "request_index".to_string()
}

fn default_response_group_id() -> String {
    "interceptor-responses".to_string()
}

impl ResponseConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            key_field: default_key_field(),
            group_id: default_response_group_id(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| InterceptorError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parses a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| InterceptorError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(mode) = std::env::var("INTERCEPTOR_BROKER_MODE") {
            match mode.to_lowercase().as_str() {
                "kafka" => self.broker.mode = BrokerMode::Kafka,
                "memory" => self.broker.mode = BrokerMode::Memory,
                _ => tracing::warn!("Invalid INTERCEPTOR_BROKER_MODE: {}", mode),
            }
        }

        if let Ok(brokers) = std::env::var("INTERCEPTOR_BROKERS") {
            self.broker.brokers = brokers;
        }

        if let Ok(url) = std::env::var("INTERCEPTOR_SCHEMA_REGISTRY_URL") {
            self.broker.schema_registry_url = Some(url);
        }

        if let Ok(protocol) = std::env::var("INTERCEPTOR_KAFKA_SECURITY_PROTOCOL") {
            let security = self
                .broker
                .security
                .get_or_insert_with(|| KafkaSecurityConfig {
                    protocol: protocol.clone(),
                    sasl_mechanism: None,
                    sasl_username: None,
                    sasl_password: None,
                    ssl_ca_location: None,
                    ssl_certificate_location: None,
                    ssl_key_location: None,
                });
            security.protocol = protocol;
            if let Ok(mechanism) = std::env::var("INTERCEPTOR_KAFKA_SASL_MECHANISM") {
                security.sasl_mechanism = Some(mechanism);
            }
            if let Ok(username) = std::env::var("INTERCEPTOR_KAFKA_SASL_USERNAME") {
                security.sasl_username = Some(username);
            }
            if let Ok(password) = std::env::var("INTERCEPTOR_KAFKA_SASL_PASSWORD") {
                security.sasl_password = Some(password);
            }
            tracing::debug!("Applied broker security from INTERCEPTOR_KAFKA_* env vars");
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_POLL_TIMEOUT_MS") {
            match value.parse() {
                Ok(v) => self.broker.poll_timeout_ms = v,
                Err(_) => tracing::warn!("Invalid INTERCEPTOR_POLL_TIMEOUT_MS: {}", value),
            }
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_WORKER_POOL_SIZE") {
            match value.parse() {
                Ok(v) => self.decide.worker_pool_size = v,
                Err(_) => tracing::warn!("Invalid INTERCEPTOR_WORKER_POOL_SIZE: {}", value),
            }
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_QUEUE_CAPACITY") {
            match value.parse() {
                Ok(v) => self.decide.queue_capacity = Some(v),
                Err(_) => tracing::warn!("Invalid INTERCEPTOR_QUEUE_CAPACITY: {}", value),
            }
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_SHUTDOWN_GRACE_MS") {
            match value.parse() {
                Ok(v) => self.decide.shutdown_grace_ms = v,
                Err(_) => tracing::warn!("Invalid INTERCEPTOR_SHUTDOWN_GRACE_MS: {}", value),
            }
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_MAX_CONSECUTIVE_FAILURES") {
            match value.parse() {
                Ok(v) => self.filter.max_consecutive_failures = Some(v),
                Err(_) => {
                    tracing::warn!("Invalid INTERCEPTOR_MAX_CONSECUTIVE_FAILURES: {}", value)
                }
            }
        }

        if let Ok(value) = std::env::var("INTERCEPTOR_RESPONSE_RETRY_BACKOFF_MS") {
            match value.parse() {
                Ok(v) => self.response.retry_backoff_ms = v,
                Err(_) => {
                    tracing::warn!("Invalid INTERCEPTOR_RESPONSE_RETRY_BACKOFF_MS: {}", value)
                }
            }
        }

        if let Ok(level) = std::env::var("INTERCEPTOR_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("INTERCEPTOR_JSON_LOGS") {
            self.logging.json_format = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(path) = std::env::var("INTERCEPTOR_LOG_FILE") {
            self.logging.file_path = Some(PathBuf::from(path));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(brokers) = &cli.brokers {
            self.broker.brokers = brokers.clone();
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if cli.json_logs {
            self.logging.json_format = true;
        }
        if let Some(path) = &cli.log_file {
            self.logging.file_path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// Ensures numeric settings are within range, entity names are unique
    /// and every entity names a topic.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.broker.mode == BrokerMode::Kafka && self.broker.brokers.trim().is_empty() {
            return Err(
                InterceptorError::Config("broker.brokers cannot be empty".to_string()).into(),
            );
        }

        if self.broker.poll_timeout_ms == 0 {
            return Err(InterceptorError::Config(
                "broker.poll_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.decide.worker_pool_size == 0 {
            return Err(InterceptorError::Config(
                "decide.worker_pool_size must be greater than 0".to_string(),
            )
            .into());
        }

        if self.decide.worker_pool_size > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(InterceptorError::Config(format!(
                "decide.worker_pool_size must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            ))
            .into());
        }

        if self.decide.queue_capacity == Some(0) {
            return Err(InterceptorError::Config(
                "decide.queue_capacity must be greater than 0 when set".to_string(),
            )
            .into());
        }

        if self.decide.meta_cache_size == 0 {
            return Err(InterceptorError::Config(
                "decide.meta_cache_size must be greater than 0".to_string(),
            )
            .into());
        }

        if self.response.key_field.trim().is_empty() {
            return Err(InterceptorError::Config(
                "response.key_field cannot be empty".to_string(),
            )
            .into());
        }

        let mut seen = HashSet::new();
        for entity in &self.interceptor.entities {
            if entity.name.trim().is_empty() {
                return Err(
                    InterceptorError::Config("entity name cannot be empty".to_string()).into(),
                );
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(InterceptorError::Config(format!(
                    "duplicate entity name: {}",
                    entity.name
                ))
                .into());
            }
            if entity.topic.trim().is_empty() {
                return Err(InterceptorError::Config(format!(
                    "entity '{}' has no topic",
                    entity.name
                ))
                .into());
            }
            if entity.max_messages_in_storage == 0 {
                return Err(InterceptorError::Config(format!(
                    "entity '{}': max_messages_in_storage must be greater than 0",
                    entity.name
                ))
                .into());
            }
            let mut scenario_names = HashSet::new();
            for scenario in &entity.scenarios {
                if !scenario_names.insert(scenario.name.as_str()) {
                    return Err(InterceptorError::Config(format!(
                        "entity '{}': duplicate scenario name '{}'",
                        entity.name, scenario.name
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }
}
