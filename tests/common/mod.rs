use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use cdc_interceptor::broker::memory::MemoryBroker;
use cdc_interceptor::config::EntityConfig;
use cdc_interceptor::decide::store::MessageStore;
use cdc_interceptor::model::{CollectedMessage, FilteredMessage};
use cdc_interceptor::scenario::{RelevanceFilter, Scenario, ScenarioRegistry, ScenarioState};

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

#[allow(dead_code)]
pub fn publish_update(broker: &MemoryBroker, topic: &str, id: i64, before: &str, after: &str) -> i64 {
    let envelope = json!({
        "before": {"id": id, "status": before},
        "after": {"id": id, "status": after},
        "op": "u"
    });
    broker.publish_json(topic, Some(&json!({"id": id}).to_string()), &envelope)
}

#[allow(dead_code)]
pub fn publish_create(broker: &MemoryBroker, topic: &str, id: i64, status: &str) -> i64 {
    let envelope = json!({"before": null, "after": {"id": id, "status": status}, "op": "c"});
    broker.publish_json(topic, Some(&json!({"id": id}).to_string()), &envelope)
}

/// Offsets seen by recording scenarios, shared with the test body.
pub type Seen = Arc<Mutex<Vec<(String, i64)>>>;

#[derive(Debug, Deserialize)]
struct RecordingParams {
    #[serde(flatten)]
    relevance: RelevanceFilter,
    #[serde(default)]
    fail: bool,
}

/// Records `(scenario, offset)` for every processed event.
pub struct RecordingScenario {
    state: ScenarioState,
    relevance: RelevanceFilter,
    fail: bool,
    seen: Seen,
}

#[async_trait]
impl Scenario for RecordingScenario {
    fn init(&mut self, name: &str, entity: &EntityConfig) -> cdc_interceptor::Result<()> {
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
        _history: Arc<MessageStore>,
    ) -> cdc_interceptor::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((self.name().to_string(), message.offset()));
        if self.fail {
            anyhow::bail!("recording scenario told to fail");
        }
        Ok(())
    }

    fn stop(&self) {
        self.state.stop();
    }
}

/// Built-in registry plus a `recording` type writing into `seen`.
#[allow(dead_code)]
pub fn registry_with_recording(seen: Seen) -> ScenarioRegistry {
    let mut registry = ScenarioRegistry::with_builtin();
    registry.register("recording", move |definition, _| {
        let params: RecordingParams = definition.params_as()?;
        Ok(Box::new(RecordingScenario {
            state: ScenarioState::default(),
            relevance: params.relevance,
            fail: params.fail,
            seen: seen.clone(),
        }))
    });
    registry
}

#[allow(dead_code)]
pub fn offsets_of(seen: &Seen, scenario: &str) -> Vec<i64> {
    let mut offsets: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| name == scenario)
        .map(|(_, offset)| *offset)
        .collect();
    offsets.sort();
    offsets
}

#[allow(dead_code)]
pub fn status_of(value: &Value) -> Option<&str> {
    value.get("status").and_then(Value::as_str)
}
