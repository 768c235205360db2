//! Decide stage: history, second relevance check and scenario dispatch.
//!
//! The [`Decider`] owns the shared queue, the bounded per-entity history
//! ([`store::MessageStore`]), the diagnostics cache ([`meta_cache::MetaCache`])
//! and the worker pool that runs scenarios. A single processing task takes
//! events from the queue in FIFO order, stores them, asks every scenario of
//! the event's entity again whether it is relevant and submits each
//! relevant scenario to the pool.
//!
//! The pool is a semaphore shared by all entities and scenarios, so total
//! scenario parallelism stays bounded regardless of the entity count. A
//! failing or panicking scenario raises its event's result to ERROR and
//! does not affect other scenarios.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdc_interceptor::broker::memory::MemoryBroker;
//! use cdc_interceptor::config::Config;
//! use cdc_interceptor::decide::Decider;
//! use cdc_interceptor::scenario::ScenarioRegistry;
//! use cdc_interceptor::schema::NoSchemaRegistry;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let mut decider = Decider::from_config(
//!     config,
//!     &ScenarioRegistry::with_builtin(),
//!     Arc::new(MemoryBroker::new()),
//!     Arc::new(NoSchemaRegistry),
//! )?;
//! decider.start()?;
//! println!("{}", decider.status_report());
//! decider.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod meta_cache;
pub mod queue;
pub mod store;

use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Broker;
use crate::collect::Collector;
use crate::config::Config;
use crate::error::{InterceptorError, Result};
use crate::filter::{Filter, FilterHandle, FilterSettings};
use crate::latch::CountDownLatch;
use crate::model::meta::{TS_DONE, TS_END_PREFIX, TS_START_PREFIX};
use crate::model::{FilteredMessage, ResultLevel};
use crate::response::ResponseRegistry;
use crate::scenario::{Scenario, ScenarioContext, ScenarioRegistry, ScenarioSet};
use crate::schema::SchemaResolver;
use crate::telemetry::ScenarioMetrics;

use meta_cache::MetaCache;
use queue::{shared_queue, QueueReceiver, QueueSender};
use store::MessageStore;

#[derive(Debug, Default)]
struct ScenarioStats {
    ok: AtomicU64,
    error: AtomicU64,
}

/// State shared between the processing task and the scenario workers.
struct DecideCore {
    scenarios: Arc<ScenarioSet>,
    store: Arc<MessageStore>,
    meta_cache: Arc<MetaCache>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    worker_cancel: CancellationToken,
    stats: Mutex<HashMap<String, Arc<ScenarioStats>>>,
}

impl DecideCore {
    fn stats_for(&self, scenario: &dyn Scenario) -> Arc<ScenarioStats> {
        let key = format!("{}/{}", scenario.entity_name(), scenario.name());
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.entry(key).or_default().clone()
    }

    fn stats_snapshot(&self, scenario: &dyn Scenario) -> (u64, u64) {
        let stats = self.stats_for(scenario);
        (
            stats.ok.load(Ordering::SeqCst),
            stats.error.load(Ordering::SeqCst),
        )
    }

    /// Stores `message` and dispatches it to every scenario that is still
    /// interested. Returns the number of dispatched scenarios.
    fn process_message(&self, message: FilteredMessage) -> usize {
        self.store.store(message.clone());

        let mut dispatched = 0;
        for scenario in self.scenarios.for_entity(message.entity_name()) {
            if !scenario.is_relevant_event(&message) {
                trace!(scenario = %scenario.name(), message = %message, "Scenario no longer relevant");
                continue;
            }
            if scenario.adds_message_meta() {
                self.meta_cache.add_if_absent(message.meta());
            }
            self.dispatch(scenario, message.clone());
            dispatched += 1;
        }
        if dispatched == 0 {
            debug!(message = %message, "Stored without relevant scenario");
        }
        dispatched
    }

    fn dispatch(&self, scenario: Arc<dyn Scenario>, message: FilteredMessage) {
        let workers = self.workers.clone();
        let cancel = self.worker_cancel.clone();
        let store = self.store.clone();
        let meta_cache = self.meta_cache.clone();
        let stats = self.stats_for(scenario.as_ref());

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            run_scenario(scenario, message, store, meta_cache, stats, cancel).await;
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_string()
    }
}

async fn run_scenario(
    scenario: Arc<dyn Scenario>,
    message: FilteredMessage,
    store: Arc<MessageStore>,
    meta_cache: Arc<MetaCache>,
    stats: Arc<ScenarioStats>,
    cancel: CancellationToken,
) {
    let name = scenario.name().to_string();
    let adds_meta = scenario.adds_message_meta();
    let metrics = ScenarioMetrics::new(message.entity_name(), &name);

    if adds_meta {
        message
            .meta()
            .lock()
            .add_timestamp_with_prefix(TS_START_PREFIX, &name);
    }

    let work = AssertUnwindSafe(scenario.process_message(message.clone(), store)).catch_unwind();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            warn!(scenario = %name, offset = message.offset(), "Scenario cancelled");
            return;
        }
        outcome = work => outcome,
    };

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    match failure {
        None => {
            stats.ok.fetch_add(1, Ordering::SeqCst);
            metrics.record_completion("ok");
        }
        Some(reason) => {
            stats.error.fetch_add(1, Ordering::SeqCst);
            error!(
                scenario = %name,
                entity = %message.entity_name(),
                offset = message.offset(),
                reason = %reason,
                "Scenario processMessage failed"
            );
            message.meta().lock().set_result_when_higher(
                ResultLevel::Error,
                Some(format!("{} failed: {}", name, reason)),
            );
            metrics.record_completion("error");
        }
    }

    if adds_meta {
        {
            let mut meta = message.meta().lock();
            meta.add_timestamp_with_prefix(TS_END_PREFIX, &name);
            meta.add_timestamp(TS_DONE);
            meta.set_result_when_higher(ResultLevel::Ok, None);
            debug!(
                "Processing time table for {}:\n{}",
                meta,
                meta.timestamps_table(true)
            );
        }
        meta_cache.notify_observers();
    }
}

fn already_started() -> InterceptorError {
    InterceptorError::Config("decider has already been started".to_string())
}

/// The central coordinator of the pipeline.
pub struct Decider {
    config: Config,
    core: Arc<DecideCore>,
    broker: Arc<dyn Broker>,
    schemas: Arc<dyn SchemaResolver>,
    responses: Option<Arc<ResponseRegistry>>,
    queue: QueueSender,
    receiver: Option<QueueReceiver>,
    clear_requests: Arc<Notify>,
    processing: Option<JoinHandle<()>>,
    processing_cancel: CancellationToken,
    observers: Option<JoinHandle<()>>,
    observers_cancel: CancellationToken,
    filters: Vec<FilterHandle>,
    latches: HashMap<String, Arc<CountDownLatch>>,
}

impl Decider {
    /// Creates a decider for already instantiated scenarios.
    pub fn new(
        config: Config,
        scenarios: ScenarioSet,
        broker: Arc<dyn Broker>,
        schemas: Arc<dyn SchemaResolver>,
    ) -> Self {
        let (queue, receiver) = shared_queue(config.decide.queue_capacity);
        let core = DecideCore {
            scenarios: Arc::new(scenarios),
            store: Arc::new(MessageStore::from_entities(&config.interceptor.entities)),
            meta_cache: Arc::new(MetaCache::new(config.decide.meta_cache_size)),
            workers: Arc::new(Semaphore::new(
                config.decide.worker_pool_size.min(Semaphore::MAX_PERMITS),
            )),
            tracker: TaskTracker::new(),
            worker_cancel: CancellationToken::new(),
            stats: Mutex::new(HashMap::new()),
        };
        Self {
            config,
            core: Arc::new(core),
            broker,
            schemas,
            responses: None,
            queue,
            receiver: Some(receiver),
            clear_requests: Arc::new(Notify::new()),
            processing: None,
            processing_cancel: CancellationToken::new(),
            observers: None,
            observers_cancel: CancellationToken::new(),
            filters: Vec::new(),
            latches: HashMap::new(),
        }
    }

    /// Instantiates every configured scenario through `registry`.
    ///
    /// Must run inside a tokio runtime, since scenarios may start response
    /// managers.
    ///
    /// # Errors
    ///
    /// Fails on the first scenario that cannot be created.
    pub fn from_config(
        config: Config,
        registry: &ScenarioRegistry,
        broker: Arc<dyn Broker>,
        schemas: Arc<dyn SchemaResolver>,
    ) -> Result<Self> {
        let responses = Arc::new(ResponseRegistry::new(
            broker.clone(),
            config.response.clone(),
        ));
        let context = ScenarioContext::new(broker.clone(), responses.clone());
        let scenarios = registry.instantiate_all(&config.interceptor.entities, &context)?;
        let mut decider = Self::new(config, scenarios, broker, schemas);
        decider.responses = Some(responses);
        Ok(decider)
    }

    /// Uses `latch` for the Filter of `entity` instead of the default
    /// single-count latch. Only effective before [`Decider::start`].
    pub fn with_filter_latch(mut self, entity: &str, latch: Arc<CountDownLatch>) -> Self {
        self.latches.insert(entity.to_string(), latch);
        self
    }

    /// Starts the processing task, the meta cache observer task and one
    /// Filter per configured entity.
    ///
    /// Every entity's consumer is created before anything is spawned, so a
    /// failed start leaves the decider unstarted.
    ///
    /// # Errors
    ///
    /// Fails when already started or when an entity's consumer cannot be
    /// created.
    pub fn start(&mut self) -> Result<()> {
        if self.receiver.is_none() {
            return Err(already_started().into());
        }

        let mut collectors = Vec::with_capacity(self.config.interceptor.entities.len());
        for entity in &self.config.interceptor.entities {
            let consumer = self
                .broker
                .consumer(&entity.topic, &entity.group_id())
                .map_err(InterceptorError::from)?;
            collectors.push(Collector::new(entity, consumer, self.schemas.clone()));
        }

        let mut receiver = self.receiver.take().ok_or_else(already_started)?;
        info!("Starting filtering and decision pipeline");

        self.observers = Some(tokio::spawn(
            self.core
                .meta_cache
                .clone()
                .run_observers(self.observers_cancel.clone()),
        ));

        let core = self.core.clone();
        let cancel = self.processing_cancel.clone();
        let clear_requests = self.clear_requests.clone();
        self.processing = Some(tokio::spawn(async move {
            info!("Decide processing loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = clear_requests.notified() => {
                        let drained = receiver.drain();
                        info!(drained, "Cleared shared queue");
                    }
                    message = receiver.recv() => match message {
                        Some(dequeued) => {
                            core.process_message(dequeued.message().clone());
                            // Leaves the queue depth only once the workers are tracked.
                            drop(dequeued);
                        }
                        None => break,
                    },
                }
            }
            info!("Decide processing loop completed");
        }));

        let settings = FilterSettings::from(&self.config.filter);
        for collector in collectors {
            let entity = collector.entity_name().to_string();
            let topic = collector.topic().to_string();
            let latch = self
                .latches
                .entry(entity.clone())
                .or_insert_with(|| Arc::new(CountDownLatch::new(1)))
                .clone();
            let filter = Filter::new(
                collector,
                self.core.scenarios.clone(),
                self.queue.clone(),
                latch,
                settings,
            );
            self.filters.push(filter.spawn());
            info!(entity = %entity, topic = %topic, "Filter started");
        }

        info!(filters = self.filters.len(), "All tasks have been started");
        Ok(())
    }

    /// Stops scenarios, the processing task, the worker pool, the meta cache
    /// observers, the Filters and the response managers, each with a bounded
    /// grace period.
    pub async fn shutdown(&mut self) {
        info!("Starting shutdown");
        let grace = self.config.decide.shutdown_grace();

        self.core.scenarios.stop_all();

        self.processing_cancel.cancel();
        if let Some(mut processing) = self.processing.take() {
            if tokio::time::timeout(grace, &mut processing).await.is_err() {
                warn!("Processing task did not stop in time, aborting");
                processing.abort();
            }
        }

        self.core.tracker.close();
        if tokio::time::timeout(grace, self.core.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                running = self.core.tracker.len(),
                "Scenario workers did not finish in time, cancelling"
            );
            self.core.worker_cancel.cancel();
            if tokio::time::timeout(grace, self.core.tracker.wait())
                .await
                .is_err()
            {
                error!("Scenario workers ignored cancellation");
            }
        }

        self.observers_cancel.cancel();
        if let Some(mut observers) = self.observers.take() {
            if tokio::time::timeout(grace, &mut observers).await.is_err() {
                warn!("Meta cache observers did not stop in time, aborting");
                observers.abort();
            }
        }

        for filter in &mut self.filters {
            filter.shutdown(grace).await;
        }

        if let Some(responses) = &self.responses {
            responses.shutdown_all(grace).await;
        }
        info!("Shutdown complete");
    }

    /// Waits until the queue is empty and no scenario is running.
    ///
    /// Returns `false` when `timeout` expires first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            while !(self.queue.is_empty() && self.core.tracker.is_empty()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub fn scenarios(&self) -> Arc<ScenarioSet> {
        self.core.scenarios.clone()
    }

    pub fn scenarios_for_entity(&self, entity: &str) -> Vec<Arc<dyn Scenario>> {
        self.core.scenarios.for_entity(entity)
    }

    /// Enqueues a message for the processing task, bypassing the Filters.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::QueueClosed` after shutdown.
    pub async fn add_message_to_shared_queue(
        &self,
        message: FilteredMessage,
    ) -> std::result::Result<(), InterceptorError> {
        self.queue.send(message).await
    }

    pub fn stored_messages(&self, entity: &str) -> Vec<FilteredMessage> {
        self.core.store.snapshot(entity)
    }

    pub fn store(&self) -> Arc<MessageStore> {
        self.core.store.clone()
    }

    pub fn meta_cache(&self) -> Arc<MetaCache> {
        self.core.meta_cache.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn filter_latch(&self, entity: &str) -> Option<Arc<CountDownLatch>> {
        self.latches.get(entity).cloned()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn filters(&self) -> &[FilterHandle] {
        &self.filters
    }

    /// Empties the history and the shared queue.
    pub fn clear_storage(&mut self) {
        self.core.store.clear();
        match self.receiver.as_mut() {
            Some(receiver) => {
                receiver.drain();
            }
            None => self.clear_requests.notify_one(),
        }
    }

    /// Ok/error invocation counts per scenario, keyed `entity/name`.
    pub fn scenario_stats(&self) -> BTreeMap<String, (u64, u64)> {
        self.core
            .scenarios
            .all()
            .iter()
            .map(|s| {
                (
                    format!("{}/{}", s.entity_name(), s.name()),
                    self.core.stats_snapshot(s.as_ref()),
                )
            })
            .collect()
    }

    /// Multi-line overview of connectors, scenarios, stores and queues.
    pub fn status_report(&self) -> String {
        let mut lines = vec!["CDC-connectors:".to_string()];
        lines.extend(self.filters.iter().map(ToString::to_string));
        if let Some(responses) = &self.responses {
            let progress = responses.progress();
            if !progress.is_empty() {
                lines.push("Response connectors:".to_string());
                lines.extend(progress.iter().map(|p| format!("  {}", p)));
            }
        }
        lines.push("Scenarios:".to_string());
        for scenario in self.core.scenarios.all() {
            let (ok, error) = self.core.stats_snapshot(scenario.as_ref());
            lines.push(format!("  {} ok={} error={}", scenario.describe(), ok, error));
        }
        lines.push("Filtered message stores:".to_string());
        for (entity, size) in self.core.store.sizes() {
            lines.push(format!("  Store for {}, size = {}", entity, size));
        }
        lines.push(format!("SharedQueue       size = {}", self.queue.len()));
        lines.push(format!(
            "MessageMeta cache size = {}",
            self.core.meta_cache.len()
        ));
        lines.join("\n")
    }
}

impl fmt::Display for Decider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_report())
    }
}
