//! Scenario plugin contract and the per-entity scenario set.
//!
//! A scenario is a narrow, entity-scoped decision unit: it reports whether a
//! change event is relevant and, if so, processes it with read access to the
//! bounded history of all entities. Scenarios are created by name through
//! the [`ScenarioRegistry`] and bound to their entity by [`Scenario::init`].

pub mod field_change;
pub mod logger;
pub mod registry;
pub mod relevance;
pub mod request_reply;

pub use registry::{ScenarioContext, ScenarioFactory, ScenarioRegistry};
pub use relevance::RelevanceFilter;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::EntityConfig;
use crate::decide::store::MessageStore;
use crate::error::Result;
use crate::model::{CollectedMessage, FilteredMessage};

/// One pluggable decision unit bound to a single entity.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Binds the scenario to its configured name and entity.
    fn init(&mut self, name: &str, entity: &EntityConfig) -> Result<()>;

    fn name(&self) -> &str;

    fn entity_name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Whether this scenario's timing and result appear in the diagnostics
    /// cache.
    fn adds_message_meta(&self) -> bool {
        true
    }

    fn is_relevant_event(&self, message: &CollectedMessage) -> bool;

    /// Processes a relevant event.
    ///
    /// `history` holds the bounded recent events of every entity, including
    /// `message` itself.
    async fn process_message(
        &self,
        message: FilteredMessage,
        history: Arc<MessageStore>,
    ) -> Result<()>;

    fn stop(&self);

    /// One-line description for status reports.
    fn describe(&self) -> String {
        format!(
            "{} on {} running={}",
            self.name(),
            self.entity_name(),
            self.is_running()
        )
    }
}

/// Name, entity and running flag shared by the built-in scenarios.
#[derive(Debug, Default)]
pub struct ScenarioState {
    name: String,
    entity_name: String,
    running: AtomicBool,
}

impl ScenarioState {
    pub fn init(&mut self, name: &str, entity: &EntityConfig) {
        self.name = name.to_string();
        self.entity_name = entity.name.clone();
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Scenarios grouped by entity, shared by the Filters and the Decider.
///
/// Lookups hand out clones of the current list, so an entity's scenarios can
/// be replaced while events are in flight.
#[derive(Default)]
pub struct ScenarioSet {
    by_entity: RwLock<HashMap<String, Vec<Arc<dyn Scenario>>>>,
}

impl ScenarioSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scenario under its entity.
    pub fn insert(&self, scenario: Arc<dyn Scenario>) {
        let mut map = self.by_entity.write().unwrap_or_else(|p| p.into_inner());
        map.entry(scenario.entity_name().to_string())
            .or_default()
            .push(scenario);
    }

    /// Replaces every scenario of `entity`.
    pub fn replace_entity(&self, entity: &str, scenarios: Vec<Arc<dyn Scenario>>) {
        let mut map = self.by_entity.write().unwrap_or_else(|p| p.into_inner());
        map.insert(entity.to_string(), scenarios);
    }

    /// Scenarios of `entity` in registration order; empty when none.
    pub fn for_entity(&self, entity: &str) -> Vec<Arc<dyn Scenario>> {
        let map = self.by_entity.read().unwrap_or_else(|p| p.into_inner());
        map.get(entity).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<dyn Scenario>> {
        let map = self.by_entity.read().unwrap_or_else(|p| p.into_inner());
        let mut entities: Vec<&String> = map.keys().collect();
        entities.sort();
        entities
            .into_iter()
            .flat_map(|entity| map[entity].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        let map = self.by_entity.read().unwrap_or_else(|p| p.into_inner());
        map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_all(&self) {
        for scenario in self.all() {
            tracing::info!(scenario = %scenario.name(), entity = %scenario.entity_name(), "Stopping scenario");
            scenario.stop();
        }
    }
}

impl fmt::Debug for ScenarioSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.all().iter().map(|s| s.describe()).collect();
        f.debug_struct("ScenarioSet").field("scenarios", &names).finish()
    }
}
