//! Scenario annotating events with their field changes.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{RelevanceFilter, Scenario, ScenarioState};
use crate::config::{EntityConfig, ScenarioDefinition};
use crate::decide::store::MessageStore;
use crate::error::Result;
use crate::model::meta::TS_READ_PREFIX;
use crate::model::{CollectedMessage, FilteredMessage, ResultLevel};

fn default_null_value() -> String {
    "null".to_string()
}

#[derive(Debug, Deserialize)]
struct FieldChangeParams {
    #[serde(flatten)]
    relevance: RelevanceFilter,

    #[serde(default = "default_null_value")]
    null_value: String,
}

/// Records which watched fields changed and links the previous event.
///
/// Entity value 0 holds the changed fields as `name: before -> after`;
/// entity value 1 holds the offset of the previous stored event with the
/// same key, when there is one.
pub struct FieldChangeScenario {
    state: ScenarioState,
    relevance: RelevanceFilter,
    null_value: String,
}

impl FieldChangeScenario {
    pub const TYPE_NAME: &'static str = "field_change";

    pub fn new(relevance: RelevanceFilter) -> Self {
        Self {
            state: ScenarioState::default(),
            relevance,
            null_value: default_null_value(),
        }
    }

    pub fn from_definition(definition: &ScenarioDefinition) -> Result<Self> {
        let params: FieldChangeParams = definition.params_as()?;
        Ok(Self {
            null_value: params.null_value,
            ..Self::new(params.relevance)
        })
    }

    fn watched_changes(&self, message: &CollectedMessage) -> Vec<String> {
        message
            .changed_fields()
            .into_iter()
            .filter(|delta| {
                self.relevance
                    .fields
                    .as_ref()
                    .map_or(true, |fields| fields.iter().any(|f| f == delta.name()))
            })
            .map(|delta| format!("{}: {}", delta.name(), delta.transition(&self.null_value)))
            .collect()
    }
}

#[async_trait]
impl Scenario for FieldChangeScenario {
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

    fn is_relevant_event(&self, message: &CollectedMessage) -> bool {
        self.is_running() && self.relevance.matches(message)
    }

    async fn process_message(
        &self,
        message: FilteredMessage,
        history: Arc<MessageStore>,
    ) -> Result<()> {
        let changes = self.watched_changes(&message);
        let previous = history.previous_for_key(
            message.entity_name(),
            message.message_key(),
            message.offset(),
        );

        let mut meta = message.meta().lock();
        meta.add_timestamp_with_prefix(TS_READ_PREFIX, self.name());
        meta.set_entity_values(0, changes.join(", "));
        if let Some(previous) = &previous {
            meta.set_entity_values(1, format!("previous offset={}", previous.offset()));
        }
        meta.set_result_when_higher(
            ResultLevel::Ok,
            Some(format!("{} field(s) changed", changes.len())),
        );
        drop(meta);

        info!(
            scenario = %self.name(),
            key = %message.message_key(),
            offset = message.offset(),
            previous_offset = previous.as_ref().map(|p| p.offset()),
            changes = ?changes,
            "Field changes recorded"
        );
        Ok(())
    }

    fn stop(&self) {
        self.state.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::changed_message;
    use serde_json::json;

    fn scenario(definition: ScenarioDefinition) -> FieldChangeScenario {
        let mut scenario = FieldChangeScenario::from_definition(&definition).unwrap();
        scenario
            .init(&definition.name, &EntityConfig::new("orders", "orders-topic"))
            .unwrap();
        scenario
    }

    #[test]
    fn test_relevance_by_watched_field() {
        let scenario = scenario(
            ScenarioDefinition::new("status", "field_change").with_param("fields", json!(["status"])),
        );
        assert!(scenario.is_relevant_event(&changed_message("orders", "1", 1, &[("status", "A", "B")])));
        assert!(!scenario.is_relevant_event(&changed_message("orders", "1", 2, &[("total", "1", "2")])));
    }

    #[tokio::test]
    async fn test_annotates_changes_and_previous_offset() {
        let scenario = scenario(ScenarioDefinition::new("changes", "field_change"));
        let store = Arc::new(MessageStore::new());

        let first = FilteredMessage::new(changed_message("orders", "7", 3, &[("status", "A", "B")]));
        let second = FilteredMessage::new(changed_message(
            "orders",
            "7",
            8,
            &[("status", "B", "C"), ("total", "1", "1")],
        ));
        store.store(first.clone());
        store.store(second.clone());

        scenario.process_message(first.clone(), store.clone()).await.unwrap();
        scenario.process_message(second.clone(), store).await.unwrap();

        let meta = second.meta().snapshot();
        assert_eq!(meta.entity_values(0), Some("status: B -> C"));
        assert_eq!(meta.entity_values(1), Some("previous offset=3"));
        assert_eq!(meta.result().unwrap().message.as_deref(), Some("1 field(s) changed"));
        assert_eq!(meta.progress(), Some("read:changes"));

        assert_eq!(first.meta().lock().entity_values(1), None);
    }
}
