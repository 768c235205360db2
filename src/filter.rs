//! Per-entity Filter: first relevance check before the decide stage.
//!
//! Each entity runs one Filter task that loops over its [`Collector`],
//! checks every collected event against the entity's scenarios and forwards
//! relevant events to the shared queue. The first scenario that reports
//! relevance settles it; the remaining scenarios are not asked.
//!
//! Collector failures are logged and retried after a backoff. With
//! `max_consecutive_failures` set, the Filter gives up after that many
//! failures in a row; otherwise it retries indefinitely.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::{BrokerError, ConnectorProgress, ConnectorState, SharedProgress};
use crate::collect::Collector;
use crate::config::FilterConfig;
use crate::decide::queue::QueueSender;
use crate::error::InterceptorError;
use crate::latch::CountDownLatch;
use crate::model::{CollectedMessage, FilteredMessage, ResultEntry};
use crate::scenario::ScenarioSet;
use crate::telemetry;

/// Retry behaviour of a Filter loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    pub max_consecutive_failures: Option<u32>,
    pub failure_backoff: Duration,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: None,
            failure_backoff: Duration::from_millis(1000),
        }
    }
}

impl From<&FilterConfig> for FilterSettings {
    fn from(config: &FilterConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures,
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
        }
    }
}

type LastProcessed = Arc<Mutex<Option<Arc<CollectedMessage>>>>;

pub struct Filter {
    collector: Collector,
    scenarios: Arc<ScenarioSet>,
    queue: QueueSender,
    latch: Arc<CountDownLatch>,
    settings: FilterSettings,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    last_processed: LastProcessed,
}

impl Filter {
    pub fn new(
        collector: Collector,
        scenarios: Arc<ScenarioSet>,
        queue: QueueSender,
        latch: Arc<CountDownLatch>,
        settings: FilterSettings,
    ) -> Self {
        info!(entity = %collector.entity_name(), topic = %collector.topic(), "Filter created");
        Self {
            collector,
            scenarios,
            queue,
            latch,
            settings,
            running: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            last_processed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn entity_name(&self) -> &str {
        self.collector.entity_name()
    }

    /// Forwards `message` to the decide stage when any scenario wants it.
    ///
    /// Returns whether the message was enqueued.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::QueueClosed` when the decide stage is gone.
    pub async fn send_message_to_decide_if_needed(
        &self,
        message: CollectedMessage,
    ) -> Result<bool, InterceptorError> {
        let message = Arc::new(message);
        *self
            .last_processed
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(message.clone());

        let relevant = self
            .scenarios
            .for_entity(message.entity_name())
            .iter()
            .any(|scenario| scenario.is_relevant_event(&message));

        let result = if relevant {
            self.queue
                .send(FilteredMessage::from_shared(message.clone()))
                .await
                .map(|_| {
                    telemetry::record_enqueued(message.entity_name());
                    info!(
                        entity = %message.entity_name(),
                        offset = message.offset(),
                        queue_size = self.queue.len(),
                        "Message is relevant and added to decide queue"
                    );
                    true
                })
        } else {
            trace!(message = %message, "Message not relevant for decide");
            Ok(false)
        };

        self.latch.count_down();
        result
    }

    /// Runs until stopped, cancelled, closed or out of retries.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let entity = self.entity_name().to_string();
        let mut failures: u32 = 0;

        'outer: while self.running.load(Ordering::SeqCst) {
            let collected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.collector.collect_messages() => result,
            };

            match collected {
                Ok(messages) => {
                    failures = 0;
                    debug!(entity = %entity, count = messages.len(), "Collected messages");
                    for message in messages {
                        let outcome = tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            outcome = self.send_message_to_decide_if_needed(message) => outcome,
                        };
                        if let Err(e) = outcome {
                            warn!(entity = %entity, error = %e, "Decide queue closed, stopping filter");
                            break 'outer;
                        }
                    }
                }
                Err(BrokerError::Closed) => {
                    info!(entity = %entity, "Consumer closed, stopping filter");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    telemetry::record_collect_failure(&entity);
                    error!(
                        entity = %entity,
                        error = %e,
                        consecutive_failures = failures,
                        "Failed to collect messages"
                    );
                    if let Some(max) = self.settings.max_consecutive_failures {
                        if failures >= max {
                            error!(entity = %entity, failures, "Giving up after consecutive failures");
                            self.collector.progress().set_progress_with(
                                ConnectorState::Failed,
                                ResultEntry::error(format!("{} consecutive failures: {}", failures, e)),
                            );
                            break;
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.failure_backoff) => {}
                    }
                    if let Err(e) = self.collector.reconnect().await {
                        debug!(entity = %entity, error = %e, "Reconnect attempt failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.collector.close().await;
        info!(entity = %entity, "Filter completed");
    }

    /// Spawns the loop on the runtime and returns its handle.
    pub fn spawn(self) -> FilterHandle {
        let handle = FilterHandle {
            entity_name: self.entity_name().to_string(),
            topic: self.collector.topic().to_string(),
            running: self.running.clone(),
            cancel: self.cancel.clone(),
            latch: self.latch.clone(),
            progress: self.collector.progress(),
            last_processed: self.last_processed.clone(),
            join: None,
        };
        FilterHandle {
            join: Some(tokio::spawn(self.run())),
            ..handle
        }
    }
}

/// Control handle of a spawned Filter.
pub struct FilterHandle {
    entity_name: String,
    topic: String,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    latch: Arc<CountDownLatch>,
    progress: SharedProgress,
    last_processed: LastProcessed,
    join: Option<JoinHandle<()>>,
}

impl FilterHandle {
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Clears the running flag and wakes the loop from any wait.
    pub fn stop_running(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.join.as_ref().map_or(false, |join| !join.is_finished())
    }

    pub fn latch(&self) -> Arc<CountDownLatch> {
        self.latch.clone()
    }

    pub fn last_processed_message(&self) -> Option<Arc<CollectedMessage>> {
        self.last_processed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn progress(&self) -> ConnectorProgress {
        self.progress.snapshot()
    }

    /// Stops the loop, waiting up to `grace` before aborting the task.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.stop_running();
        let Some(mut join) = self.join.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => debug!(entity = %self.entity_name, "Filter task finished"),
            Ok(Err(e)) => error!(entity = %self.entity_name, error = %e, "Filter task failed"),
            Err(_) => {
                warn!(entity = %self.entity_name, "Filter did not stop within grace period, aborting");
                join.abort();
            }
        }
    }
}

impl fmt::Display for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  Filter on entity={}, topic={}, {}",
            self.entity_name,
            self.topic,
            self.progress.snapshot()
        )
    }
}
