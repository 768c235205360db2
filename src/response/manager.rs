//! Response managers: one dispatcher task per response topic.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{JsonResponseDecoder, ResponseDecoder};
use super::dispatcher::ResponseDispatcher;
use super::handler::{PendingResponses, ResponseFuture};
use crate::broker::{Broker, BrokerError, ConnectorProgress, RecordConsumer, SharedProgress};
use crate::config::ResponseConfig;

/// Registers requests and awaits their responses on one topic.
///
/// Register the key before sending the request, so a fast reply cannot
/// arrive unmatched.
pub struct ResponseManager<V> {
    topic: String,
    pending: PendingResponses<V>,
    progress: SharedProgress,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + 'static> ResponseManager<V> {
    /// Spawns the dispatcher for `consumer` on the current runtime.
    pub fn start<D>(consumer: Box<dyn RecordConsumer>, decoder: D, retry_backoff: Duration) -> Self
    where
        D: ResponseDecoder<Value = V>,
    {
        let topic = consumer.topic().to_string();
        let progress = consumer.progress();
        let pending = PendingResponses::new();
        let cancel = CancellationToken::new();
        let dispatcher = ResponseDispatcher::new(
            consumer,
            decoder,
            pending.clone(),
            retry_backoff,
            cancel.clone(),
        );
        let task = tokio::spawn(dispatcher.run());
        info!(topic = %topic, "Response manager started");
        Self {
            topic,
            pending,
            progress,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    pub fn register_and_get_future(&self, key: &str) -> ResponseFuture<V> {
        self.pending.register(key)
    }

    /// Drops the handler for `key`, typically after the caller timed out.
    pub fn forget(&self, key: &str) -> bool {
        self.pending.forget(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn progress(&self) -> ConnectorProgress {
        self.progress.snapshot()
    }

    /// Stops the dispatcher, aborting it after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut task) = task else {
            return;
        };
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(topic = %self.topic, "Response dispatcher did not stop in time, aborting");
            task.abort();
            self.pending.clear();
        }
        debug!(topic = %self.topic, "Response manager stopped");
    }
}

/// JSON response managers created on first use, one per response topic.
pub struct ResponseRegistry {
    broker: Arc<dyn Broker>,
    config: ResponseConfig,
    managers: Mutex<HashMap<String, Arc<ResponseManager<Value>>>>,
}

impl ResponseRegistry {
    pub fn new(broker: Arc<dyn Broker>, config: ResponseConfig) -> Self {
        Self {
            broker,
            config,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Field that carries the correlation key in requests and responses.
    pub fn key_field(&self) -> &str {
        &self.config.key_field
    }

    /// Manager for `topic`, started on the current runtime if needed.
    ///
    /// # Errors
    ///
    /// Returns the broker error when the response consumer cannot be created.
    pub fn manager_for(&self, topic: &str) -> Result<Arc<ResponseManager<Value>>, BrokerError> {
        let mut managers = self.managers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(manager) = managers.get(topic) {
            return Ok(manager.clone());
        }
        let consumer = self.broker.consumer(topic, &self.config.group_id)?;
        let manager = Arc::new(ResponseManager::start(
            consumer,
            JsonResponseDecoder::new(self.config.key_field.clone()),
            self.config.retry_backoff(),
        ));
        managers.insert(topic.to_string(), manager.clone());
        Ok(manager)
    }

    pub fn topics(&self) -> Vec<String> {
        let managers = self.managers.lock().unwrap_or_else(|p| p.into_inner());
        let mut topics: Vec<String> = managers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn progress(&self) -> Vec<ConnectorProgress> {
        let managers = self.managers.lock().unwrap_or_else(|p| p.into_inner());
        let mut progress: Vec<ConnectorProgress> =
            managers.values().map(|m| m.progress()).collect();
        progress.sort_by(|a, b| a.name.cmp(&b.name));
        progress
    }

    pub async fn shutdown_all(&self, grace: Duration) {
        let managers: Vec<Arc<ResponseManager<Value>>> = {
            let mut managers = self.managers.lock().unwrap_or_else(|p| p.into_inner());
            managers.drain().map(|(_, m)| m).collect()
        };
        for manager in managers {
            manager.shutdown(grace).await;
        }
    }
}
