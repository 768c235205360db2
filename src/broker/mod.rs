//! Broker abstraction for CDC topics and the request/response channel
//!
//! The pipeline talks to the broker only through [`RecordConsumer`],
//! [`RecordProducer`] and the [`Broker`] factory. Two implementations are
//! provided:
//!
//! - [`kafka::KafkaBroker`] backed by `rdkafka`
//! - [`memory::MemoryBroker`], an in-process topic log used for tests and
//!   the `--mock` run mode (optionally fed by [`synthetic::SyntheticFeed`])

pub mod config;
pub mod kafka;
pub mod memory;
pub mod progress;
pub mod synthetic;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use config::{ConfigError, KafkaClientConfig};
pub use progress::{ConnectorProgress, ConnectorState, SharedProgress};

/// Errors raised by broker clients.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error reported by the Kafka client
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// The broker is not reachable
    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    /// The client was closed
    #[error("Broker client closed")]
    Closed,

    /// Invalid client configuration
    #[error("Broker configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// One raw record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Producer or log-append time in epoch milliseconds
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl BrokerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp_ms: None,
            key: None,
            payload: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Key as lossy UTF-8.
    pub fn key_as_string(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// A subscription to one topic.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    fn topic(&self) -> &str;

    /// Waits up to one poll interval for records.
    ///
    /// An empty vector means nothing arrived in time.
    async fn poll(&mut self) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Shared connection state of this consumer.
    fn progress(&self) -> SharedProgress;

    fn is_connected(&self) -> bool {
        self.progress().is_connected()
    }

    /// Attempts to resume after a disconnect.
    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.progress().set_progress(ConnectorState::Connecting);
        Ok(())
    }

    async fn close(&mut self);
}

/// Publishes records to any topic.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8])
        -> Result<(), BrokerError>;
}

/// Creates consumers and producers for one broker cluster.
pub trait Broker: Send + Sync {
    fn consumer(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn RecordConsumer>, BrokerError>;

    fn producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = BrokerRecord::new("orders", 0, 5)
            .with_key("42")
            .with_payload(b"{}".to_vec())
            .with_timestamp_ms(1_700_000_000_000);
        assert_eq!(record.key_as_string().as_deref(), Some("42"));
        assert_eq!(record.payload.as_deref(), Some(&b"{}"[..]));
        assert_eq!(record.timestamp_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn test_broker_error_display() {
        let error = BrokerError::Disconnected("memory broker offline".to_string());
        assert_eq!(
            error.to_string(),
            "Broker disconnected: memory broker offline"
        );
    }
}
