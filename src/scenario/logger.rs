//! Scenario that logs every relevant event.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{RelevanceFilter, Scenario, ScenarioState};
use crate::config::{EntityConfig, ScenarioDefinition};
use crate::decide::store::MessageStore;
use crate::error::Result;
use crate::model::{CdcAction, CollectedMessage, FilteredMessage};

/// Logs the extended rendering of each event.
///
/// Relevant for all actions unless `actions` is configured. Does not add
/// its events to the diagnostics cache.
pub struct LoggerScenario {
    state: ScenarioState,
    relevance: RelevanceFilter,
}

impl LoggerScenario {
    pub const TYPE_NAME: &'static str = "logger";

    pub fn new(relevance: RelevanceFilter) -> Self {
        Self {
            state: ScenarioState::default(),
            relevance,
        }
    }

    pub fn from_definition(definition: &ScenarioDefinition) -> Result<Self> {
        let mut relevance: RelevanceFilter = definition.params_as()?;
        if !definition.params.contains_key("actions") {
            relevance.actions = CdcAction::ALL.to_vec();
        }
        Ok(Self::new(relevance))
    }
}

#[async_trait]
impl Scenario for LoggerScenario {
    fn init(&mut self, name: &str, entity: &EntityConfig) -> Result<()> {
        self.state.init(name, entity);
        Ok(())
    }

    fn name(&self) -> &str {
        self.state.name()
    }

    fn entity_name(&self) -> &str {
        self.state.entity_name()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn adds_message_meta(&self) -> bool {
        false
    }

    fn is_relevant_event(&self, message: &CollectedMessage) -> bool {
        self.is_running() && self.relevance.matches(message)
    }

    async fn process_message(
        &self,
        message: FilteredMessage,
        history: Arc<MessageStore>,
    ) -> Result<()> {
        info!(
            scenario = %self.name(),
            history = history.len(message.entity_name()),
            "{}",
            message.to_extended_string()
        );
        Ok(())
    }

    fn stop(&self) {
        self.state.stop();
    }
}
