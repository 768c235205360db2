//! Kafka-backed broker using `rdkafka`.
//!
//! Each consumer owns a `StreamConsumer` subscribed to a single topic. A poll
//! waits up to the configured poll timeout for the first record and then
//! drains whatever is already buffered, up to the batch limit.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::KafkaClientConfig;
use super::progress::{ConnectorState, SharedProgress};
use super::{Broker, BrokerError, BrokerRecord, RecordConsumer, RecordProducer};
use crate::model::ResultEntry;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn client_config(settings: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

/// Factory for Kafka consumers and producers sharing one client config.
#[derive(Debug, Clone)]
pub struct KafkaBroker {
    config: KafkaClientConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaClientConfig) -> Self {
        info!(
            brokers = %config.brokers,
            security_protocol = %config.security_protocol.as_str(),
            "Creating Kafka broker"
        );
        Self { config }
    }
}

impl Broker for KafkaBroker {
    fn consumer(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn RecordConsumer>, BrokerError> {
        Ok(Box::new(KafkaRecordConsumer::new(
            &self.config,
            topic,
            group_id,
        )?))
    }

    fn producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError> {
        let producer: FutureProducer = client_config(self.config.producer_settings())
            .create()
            .map_err(|e| BrokerError::Kafka(e.to_string()))?;
        Ok(Arc::new(KafkaRecordProducer { producer }))
    }
}

/// Single-topic Kafka consumer.
pub struct KafkaRecordConsumer {
    topic: String,
    consumer: StreamConsumer,
    poll_timeout: Duration,
    max_batch_size: usize,
    progress: SharedProgress,
}

impl KafkaRecordConsumer {
    /// Creates the consumer and subscribes it to `topic`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Kafka` if the client cannot be created or the
    /// subscription is rejected.
    pub fn new(
        config: &KafkaClientConfig,
        topic: &str,
        group_id: &str,
    ) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = client_config(config.consumer_settings(group_id))
            .create()
            .map_err(|e| BrokerError::Kafka(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BrokerError::Kafka(e.to_string()))?;

        let progress = SharedProgress::new(format!("kafka:{}", topic));
        progress.set_progress(ConnectorState::Connecting);
        info!(topic = %topic, group_id = %group_id, "Subscribed Kafka consumer");

        Ok(Self {
            topic: topic.to_string(),
            consumer,
            poll_timeout: config.poll_timeout,
            max_batch_size: config.max_batch_size,
            progress,
        })
    }

    fn to_record(message: &BorrowedMessage<'_>) -> BrokerRecord {
        BrokerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp_ms: message.timestamp().to_millis(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }
}

#[async_trait]
impl RecordConsumer for KafkaRecordConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&mut self) -> Result<Vec<BrokerRecord>, BrokerError> {
        let first = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(e)) => {
                self.progress.set_progress_with(
                    ConnectorState::Reconnecting,
                    ResultEntry::warn(e.to_string()),
                );
                return Err(BrokerError::Kafka(e.to_string()));
            }
            Ok(Ok(message)) => Self::to_record(&message),
        };
        self.progress.set_progress(ConnectorState::Connected);

        let mut records = vec![first];
        while records.len() < self.max_batch_size {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(Self::to_record(&message)),
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, error = %e, "Error while draining batch");
                    break;
                }
                Err(_) => break,
            }
        }
        debug!(topic = %self.topic, count = records.len(), "Polled records");
        Ok(records)
    }

    fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        self.progress.set_progress(ConnectorState::Stopped);
        info!(topic = %self.topic, "Closed Kafka consumer");
    }
}

/// Kafka producer shared by scenarios.
pub struct KafkaRecordProducer {
    producer: FutureProducer,
}

#[async_trait]
impl RecordProducer for KafkaRecordProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| BrokerError::Kafka(e.to_string()))?;
        debug!(topic = %topic, key = ?key, "Sent record");
        Ok(())
    }
}
