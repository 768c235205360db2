//! Scenario that consults an external engine through the broker.
//!
//! For each relevant event a JSON request is published to `request_topic`
//! under a fresh correlation key, and the reply is awaited on
//! `response_topic` for at most `timeout_ms`. The reply's `status` field
//! decides the event's result: `error`/`failed` is ERROR, `warn`/`warning`
//! is WARN, anything else is OK. A missing reply is a WARN.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RelevanceFilter, Scenario, ScenarioContext, ScenarioState};
use crate::broker::RecordProducer;
use crate::config::{EntityConfig, ScenarioDefinition};
use crate::decide::store::MessageStore;
use crate::error::{InterceptorError, Result};
use crate::model::meta::{TS_RECV_PREFIX, TS_SEND_PREFIX};
use crate::model::{CollectedMessage, FilteredMessage, ResultLevel};
use crate::response::{ResponseError, ResponseManager};

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
struct RequestReplyParams {
    request_topic: String,
    response_topic: String,

    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,

    #[serde(flatten)]
    relevance: RelevanceFilter,
}

pub struct RequestReplyScenario {
    state: ScenarioState,
    relevance: RelevanceFilter,
    request_topic: String,
    timeout: Duration,
    key_field: String,
    producer: Arc<dyn RecordProducer>,
    responses: Arc<ResponseManager<Value>>,
}

impl RequestReplyScenario {
    pub const TYPE_NAME: &'static str = "request_reply";

    /// Builds the scenario and starts the response manager of its topic.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails on invalid params or when the producer or response consumer
    /// cannot be created.
    pub fn from_definition(definition: &ScenarioDefinition, context: &ScenarioContext) -> Result<Self> {
        let params: RequestReplyParams = definition.params_as()?;
        let producer = context.broker.producer().map_err(InterceptorError::from)?;
        let responses = context
            .responses
            .manager_for(&params.response_topic)
            .map_err(InterceptorError::from)?;
        Ok(Self {
            state: ScenarioState::default(),
            relevance: params.relevance,
            request_topic: params.request_topic,
            timeout: Duration::from_millis(params.timeout_ms),
            key_field: context.responses.key_field().to_string(),
            producer,
            responses,
        })
    }

    fn build_request(&self, key: &str, message: &CollectedMessage) -> Value {
        let changed: Vec<&str> = message.changed_fields().iter().map(|d| d.name()).collect();
        let mut request = json!({
            "entity": message.entity_name(),
            "action": message.action().as_str(),
            "message_key": message.message_key(),
            "offset": message.offset(),
            "changed_fields": changed,
            "payload": message.payload_as_json(),
        });
        if let Value::Object(map) = &mut request {
            map.insert(self.key_field.clone(), Value::String(key.to_string()));
        }
        request
    }
}

/// Result level and text for a reply.
fn evaluate_response(response: &Value) -> (ResultLevel, String) {
    let status = response
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("ok")
        .to_lowercase();
    let level = match status.as_str() {
        "error" | "failed" => ResultLevel::Error,
        "warn" | "warning" => ResultLevel::Warn,
        _ => ResultLevel::Ok,
    };
    let text = match response.get("message").and_then(Value::as_str) {
        Some(message) => format!("status={}: {}", status, message),
        None => format!("status={}", status),
    };
    (level, text)
}

#[async_trait]
impl Scenario for RequestReplyScenario {
    fn init(&mut self, name: &str, entity: &EntityConfig) -> Result<()> {
        if self.request_topic.is_empty() {
            return Err(InterceptorError::Config(format!(
                "Scenario '{}' needs a request_topic",
                name
            ))
            .into());
        }
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
    ) -> Result<()> {
        let key = format!("CDC-{}", Uuid::new_v4());
        let request = serde_json::to_vec(&self.build_request(&key, &message))?;

        let future = self.responses.register_and_get_future(&key);
        message
            .meta()
            .lock()
            .add_timestamp_with_prefix(TS_SEND_PREFIX, self.name());
        if let Err(e) = self
            .producer
            .send(&self.request_topic, Some(&key), &request)
            .await
        {
            self.responses.forget(&key);
            return Err(InterceptorError::from(e).into());
        }
        debug!(scenario = %self.name(), key = %key, topic = %self.request_topic, "Request sent");

        let response = match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(InterceptorError::from(e).into()),
            Err(_) => {
                self.responses.forget(&key);
                let timeout = ResponseError::Timeout {
                    key: key.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(scenario = %self.name(), error = %timeout, "No response");
                message
                    .meta()
                    .lock()
                    .set_result_when_higher(ResultLevel::Warn, Some(timeout.to_string()));
                return Ok(());
            }
        };

        let (level, text) = evaluate_response(&response);
        {
            let mut meta = message.meta().lock();
            meta.add_timestamp_with_prefix(TS_RECV_PREFIX, self.name());
            meta.set_entity_values(0, text.clone());
            meta.set_result_when_higher(level, Some(format!("{}: {}", self.name(), text)));
        }
        info!(scenario = %self.name(), key = %key, level = %level, "Response received");
        Ok(())
    }

    fn stop(&self) {
        self.state.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Broker;
    use crate::config::ResponseConfig;
    use crate::response::ResponseRegistry;
    use crate::test_utils::changed_message;

    struct Fixture {
        broker: MemoryBroker,
        registry: Arc<ResponseRegistry>,
        scenario: RequestReplyScenario,
    }

    fn fixture(timeout_ms: u64) -> Fixture {
        let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(20));
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let registry = Arc::new(ResponseRegistry::new(shared.clone(), ResponseConfig::default()));
        let context = ScenarioContext::new(shared, registry.clone());
        let definition = ScenarioDefinition::new("engine", "request_reply")
            .with_param("request_topic", json!("requests"))
            .with_param("response_topic", json!("responses"))
            .with_param("timeout_ms", json!(timeout_ms));
        let mut scenario = RequestReplyScenario::from_definition(&definition, &context).unwrap();
        scenario
            .init("engine", &EntityConfig::new("orders", "orders-topic"))
            .unwrap();
        Fixture {
            broker,
            registry,
            scenario,
        }
    }

    /// Answers every request on `requests` with `reply`.
    fn spawn_engine(broker: MemoryBroker, reply: Value) {
        tokio::spawn(async move {
            let mut consumer = broker.consumer("requests", "engine").unwrap();
            loop {
                let Ok(records) = consumer.poll().await else {
                    return;
                };
                for record in records {
                    let key = record.key_as_string().unwrap_or_default();
                    broker.publish_json("responses", Some(&key), &reply);
                }
            }
        });
    }

    #[test]
    fn test_evaluate_response_levels() {
        assert_eq!(evaluate_response(&json!({"status": "FAILED"})).0, ResultLevel::Error);
        assert_eq!(evaluate_response(&json!({"status": "warning"})).0, ResultLevel::Warn);
        assert_eq!(evaluate_response(&json!({})).0, ResultLevel::Ok);
        assert_eq!(
            evaluate_response(&json!({"status": "ok", "message": "fine"})).1,
            "status=ok: fine"
        );
    }

    #[tokio::test]
    async fn test_request_carries_correlation_key() {
        let fixture = fixture(1000);
        let message = changed_message("orders", "5", 2, &[("status", "A", "B")]);
        let request = fixture.scenario.build_request("CDC-1", &message);
        assert_eq!(request["request_index"], "CDC-1");
        assert_eq!(request["action"], "CHANGED");
        assert_eq!(request["changed_fields"], json!(["status"]));
        fixture.registry.shutdown_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reply_sets_result() {
        let fixture = fixture(5000);
        spawn_engine(fixture.broker.clone(), json!({"status": "error", "message": "blocked"}));

        let message = FilteredMessage::new(changed_message("orders", "5", 2, &[("status", "A", "B")]));
        fixture
            .scenario
            .process_message(message.clone(), Arc::new(MessageStore::new()))
            .await
            .unwrap();

        let meta = message.meta().snapshot();
        assert_eq!(meta.worst_level(), ResultLevel::Error);
        assert!(meta.timestamp("send:engine").is_some());
        assert!(meta.timestamp("recv:engine").is_some());
        assert_eq!(meta.entity_values(0), Some("status=error: blocked"));
        assert_eq!(fixture.broker.record_count("requests"), 1);
        fixture.registry.shutdown_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_missing_reply_is_warning() {
        let fixture = fixture(100);
        let message = FilteredMessage::new(changed_message("orders", "5", 2, &[("status", "A", "B")]));
        fixture
            .scenario
            .process_message(message.clone(), Arc::new(MessageStore::new()))
            .await
            .unwrap();

        assert_eq!(message.meta().lock().worst_level(), ResultLevel::Warn);
        let manager = fixture.registry.manager_for("responses").unwrap();
        assert_eq!(manager.pending_count(), 0);
        fixture.registry.shutdown_all(Duration::from_secs(1)).await;
    }
}
