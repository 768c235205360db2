//! CDC interceptor library
//!
//! Consumes change-data-capture events per business entity, filters them by
//! scenario relevance and dispatches relevant events to pluggable scenarios
//! on a bounded worker pool.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `broker`: Broker abstraction with Kafka and in-memory implementations
//! - `collect`: Decoding raw records into change events
//! - `filter`: Per-entity relevance filtering in front of the shared queue
//! - `decide`: Shared queue, history store, diagnostics cache and scenario dispatch
//! - `scenario`: Scenario trait, built-in scenarios and the factory registry
//! - `response`: Request/response correlation over a response topic
//! - `model`: Change events, field deltas and per-event diagnostics
//! - `schema`: Schema resolution for decoded records
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdc_interceptor::broker::memory::MemoryBroker;
//! use cdc_interceptor::decide::Decider;
//! use cdc_interceptor::scenario::ScenarioRegistry;
//! use cdc_interceptor::schema::NoSchemaRegistry;
//! use cdc_interceptor::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let mut decider = Decider::from_config(
//!         config,
//!         &ScenarioRegistry::with_builtin(),
//!         Arc::new(MemoryBroker::new()),
//!         Arc::new(NoSchemaRegistry),
//!     )?;
//!     decider.start()?;
//!     decider.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cli;
pub mod collect;
pub mod commands;
pub mod config;
pub mod decide;
pub mod error;
pub mod filter;
pub mod latch;
pub mod logging;
pub mod model;
pub mod response;
pub mod scenario;
pub mod schema;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use decide::Decider;
pub use error::{InterceptorError, Result};
pub use scenario::{Scenario, ScenarioRegistry};

#[cfg(test)]
pub mod test_utils;
