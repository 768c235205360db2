//! In-process broker for tests and mock runs.
//!
//! Topics are append-only logs held in memory. Every consumer reads its topic
//! from the beginning, independent of the group id. The whole broker can be
//! switched offline with [`MemoryBroker::set_connected`] to exercise
//! reconnect paths.
//!
//! # Example
//!
//! ```
//! use cdc_interceptor::broker::memory::MemoryBroker;
//! use cdc_interceptor::broker::Broker;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! broker.publish("orders", Some("1"), Some(br#"{"after":{"id":1}}"#));
//!
//! let mut consumer = broker.consumer("orders", "test").unwrap();
//! let records = consumer.poll().await.unwrap();
//! assert_eq!(records.len(), 1);
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::progress::{ConnectorState, SharedProgress};
use super::{Broker, BrokerError, BrokerRecord, RecordConsumer, RecordProducer};
use crate::model::ResultEntry;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct TopicLog {
    records: Mutex<Vec<BrokerRecord>>,
    appended: Notify,
}

impl TopicLog {
    fn read_from(&self, position: usize) -> Vec<BrokerRecord> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.get(position..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

struct Inner {
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    connected: AtomicBool,
    poll_timeout: Duration,
}

/// Shared in-memory broker; clones refer to the same topics.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    /// Creates a broker whose empty polls wait `poll_timeout`.
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                poll_timeout,
            }),
        }
    }

    fn topic_log(&self, topic: &str) -> Arc<TopicLog> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        topics.entry(topic.to_string()).or_default().clone()
    }

    /// Appends a record and returns its offset.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: Option<&[u8]>) -> i64 {
        let log = self.topic_log(topic);
        let offset = {
            let mut records = log.records.lock().unwrap_or_else(|p| p.into_inner());
            let offset = records.len() as i64;
            let mut record =
                BrokerRecord::new(topic, 0, offset).with_timestamp_ms(Utc::now().timestamp_millis());
            record.key = key.map(|k| k.as_bytes().to_vec());
            record.payload = payload.map(<[u8]>::to_vec);
            records.push(record);
            offset
        };
        log.appended.notify_waiters();
        debug!(topic = %topic, offset, "Published record to memory broker");
        offset
    }

    /// Appends a JSON payload and returns its offset.
    pub fn publish_json(&self, topic: &str, key: Option<&str>, payload: &serde_json::Value) -> i64 {
        self.publish(topic, key, Some(payload.to_string().as_bytes()))
    }

    /// All records published to `topic` so far.
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.topic_log(topic).read_from(0)
    }

    pub fn record_count(&self, topic: &str) -> usize {
        self.topic_log(topic)
            .records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Takes the whole broker on- or offline.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Broker for MemoryBroker {
    fn consumer(
        &self,
        topic: &str,
        _group_id: &str,
    ) -> Result<Box<dyn RecordConsumer>, BrokerError> {
        let progress = SharedProgress::new(format!("memory:{}", topic));
        progress.set_progress(ConnectorState::Connecting);
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            log: self.topic_log(topic),
            position: 0,
            progress,
        }))
    }

    fn producer(&self) -> Result<Arc<dyn RecordProducer>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
        }))
    }
}

/// Consumer reading one topic of a [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    log: Arc<TopicLog>,
    position: usize,
    progress: SharedProgress,
}

#[async_trait]
impl RecordConsumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&mut self) -> Result<Vec<BrokerRecord>, BrokerError> {
        if self.progress.state() == ConnectorState::Stopped {
            return Err(BrokerError::Closed);
        }
        if !self.broker.is_connected() {
            self.progress.set_progress_with(
                ConnectorState::Reconnecting,
                ResultEntry::warn("memory broker offline"),
            );
            return Err(BrokerError::Disconnected(self.topic.clone()));
        }

        let deadline = tokio::time::Instant::now() + self.broker.inner.poll_timeout;
        loop {
            let appended = self.log.appended.notified();
            let records = self.log.read_from(self.position);
            if !records.is_empty() {
                self.position += records.len();
                self.progress.set_progress(ConnectorState::Connected);
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        if self.broker.is_connected() {
            self.progress.set_progress(ConnectorState::Connecting);
            Ok(())
        } else {
            Err(BrokerError::Disconnected(self.topic.clone()))
        }
    }

    async fn close(&mut self) {
        self.progress.set_progress(ConnectorState::Stopped);
    }
}

/// Producer appending to a [`MemoryBroker`].
pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl RecordProducer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        if !self.broker.is_connected() {
            return Err(BrokerError::Disconnected(topic.to_string()));
        }
        self.broker.publish(topic, key, Some(payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_returns_published_records_once() {
        let broker = MemoryBroker::new();
        broker.publish("orders", Some("1"), Some(b"a"));
        broker.publish("orders", Some("2"), Some(b"b"));

        let mut consumer = broker.consumer("orders", "g").unwrap();
        let records = consumer.poll().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].offset, 1);
        assert_eq!(records[0].key_as_string().as_deref(), Some("1"));

        let again = consumer.poll().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = MemoryBroker::with_poll_timeout(Duration::from_secs(5));
        let mut consumer = broker.consumer("orders", "g").unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("orders", None, Some(b"x"));
        });

        let records = tokio::time::timeout(Duration::from_secs(2), consumer.poll())
            .await
            .expect("poll should wake before its own timeout")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(consumer.progress().state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_disconnected_broker_reports_reconnecting() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("orders", "g").unwrap();
        assert!(consumer.is_connected());

        broker.set_connected(false);
        assert!(matches!(
            consumer.poll().await,
            Err(BrokerError::Disconnected(_))
        ));
        assert!(!consumer.is_connected());
        assert!(consumer.reconnect().await.is_err());

        broker.set_connected(true);
        consumer.reconnect().await.unwrap();
        assert!(consumer.is_connected());
    }

    #[tokio::test]
    async fn test_producer_appends() {
        let broker = MemoryBroker::new();
        let producer = broker.producer().unwrap();
        producer.send("requests", Some("k"), b"{}").await.unwrap();
        assert_eq!(broker.record_count("requests"), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_rejects_poll() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("orders", "g").unwrap();
        consumer.close().await;
        assert!(matches!(consumer.poll().await, Err(BrokerError::Closed)));
    }
}
