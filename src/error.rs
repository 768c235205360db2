//! Error types for the CDC interceptor
//!
//! This module defines the crate-level error enum, using `thiserror` for
//! ergonomic error handling. Component errors (broker, response correlation,
//! shared queue) live next to the component and convert into
//! [`InterceptorError`] where they cross module boundaries.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::response::ResponseError;

/// Main error type for interceptor operations
///
/// Covers configuration loading, event decoding, schema resolution,
/// scenario instantiation and execution, and the underlying broker.
#[derive(Error, Debug)]
pub enum InterceptorError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A scenario definition names a type that is not registered
    #[error("Unknown scenario type '{scenario_type}' for scenario '{name}'")]
    UnknownScenario {
        /// Scenario name from the configuration
        name: String,
        /// Requested scenario type
        scenario_type: String,
    },

    /// A scenario failed to initialize or to process an event
    #[error("Scenario '{name}' error: {message}")]
    Scenario {
        /// Scenario name
        name: String,
        /// Failure description
        message: String,
    },

    /// A broker record could not be decoded into a change event
    #[error("Decode error: {0}")]
    Decode(String),

    /// Schema lookup or parsing failed
    #[error("Schema error: {0}")]
    Schema(String),

    /// The shared decide queue was closed
    #[error("Shared queue is closed")]
    QueueClosed,

    /// Broker errors
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Response correlation errors
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP errors from the schema registry client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for interceptor operations
///
/// Uses `anyhow::Result` for flexible error handling with context.
pub type Result<T> = anyhow::Result<T>;
