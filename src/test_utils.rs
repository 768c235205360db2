//! Test utilities
//!
//! Message builders and a configurable stub scenario shared by the unit
//! tests of the pipeline stages.

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EntityConfig;
use crate::decide::store::MessageStore;
use crate::error::{InterceptorError, Result};
use crate::model::{CdcAction, CollectedMessage, FieldDelta, FieldType, FieldValue, FilteredMessage};
use crate::scenario::{Scenario, ScenarioState};

fn string_value(text: &str) -> Option<FieldValue> {
    Some(FieldValue::String(text.to_string()))
}

/// A CHANGED event whose fields are `(name, before, after)` strings.
pub fn changed_message(
    entity: &str,
    key: &str,
    offset: i64,
    fields: &[(&str, &str, &str)],
) -> CollectedMessage {
    let deltas = fields.iter().map(|(name, before, after)| {
        FieldDelta::new(*name, FieldType::String, string_value(before), string_value(after))
    });
    CollectedMessage::new(CdcAction::Changed, entity, offset, None, key, deltas)
}

/// A CREATED event whose fields are `(name, value)` strings.
pub fn created_message(
    entity: &str,
    key: &str,
    offset: i64,
    fields: &[(&str, &str)],
) -> CollectedMessage {
    let deltas = fields
        .iter()
        .map(|(name, value)| FieldDelta::new(*name, FieldType::String, None, string_value(value)));
    CollectedMessage::new(CdcAction::Created, entity, offset, None, key, deltas)
}

/// A changed `status` event keyed by its offset.
pub fn filtered_message(entity: &str, offset: i64) -> FilteredMessage {
    FilteredMessage::new(changed_message(
        entity,
        &offset.to_string(),
        offset,
        &[("status", "A", "B")],
    ))
}

/// Debezium-style Avro envelope for an `orders` row.
pub const ORDER_ENVELOPE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Envelope",
    "fields": [
        {"name": "before", "type": ["null", {
            "type": "record",
            "name": "Value",
            "fields": [
                {"name": "id", "type": "long"},
                {"name": "status", "type": ["null", "string"]},
                {"name": "total", "type": "double"}
            ]
        }], "default": null},
        {"name": "after", "type": ["null", "Value"], "default": null},
        {"name": "op", "type": "string"}
    ]
}"#;

/// Avro key record of an `orders` row.
pub const ORDER_KEY_SCHEMA: &str = r#"{
    "type": "record",
    "name": "Key",
    "fields": [{"name": "id", "type": "long"}]
}"#;

/// An `orders` row image wrapped in the envelope's nullable union.
pub fn avro_order_row(id: i64, status: &str, total: f64) -> AvroValue {
    AvroValue::Union(
        1,
        Box::new(AvroValue::Record(vec![
            ("id".to_string(), AvroValue::Long(id)),
            (
                "status".to_string(),
                AvroValue::Union(1, Box::new(AvroValue::String(status.to_string()))),
            ),
            ("total".to_string(), AvroValue::Double(total)),
        ])),
    )
}

fn avro_envelope(before: AvroValue, after: AvroValue, op: &str) -> AvroValue {
    AvroValue::Record(vec![
        ("before".to_string(), before),
        ("after".to_string(), after),
        ("op".to_string(), AvroValue::String(op.to_string())),
    ])
}

/// An update moving `status` from `from` to `to` with an unchanged total.
pub fn avro_order_update(id: i64, from: &str, to: &str) -> AvroValue {
    avro_envelope(
        avro_order_row(id, from, 10.5),
        avro_order_row(id, to, 10.5),
        "u",
    )
}

/// An insert of a row with a total of 10.5.
pub fn avro_order_create(id: i64, status: &str) -> AvroValue {
    avro_envelope(
        AvroValue::Union(0, Box::new(AvroValue::Null)),
        avro_order_row(id, status, 10.5),
        "c",
    )
}

/// The avro key record for `id`.
pub fn avro_order_key(id: i64) -> AvroValue {
    AvroValue::Record(vec![("id".to_string(), AvroValue::Long(id))])
}

/// Encodes `value` in the Confluent wire format under `schema_id`.
pub fn confluent_payload(schema_id: u32, schema_text: &str, value: AvroValue) -> Vec<u8> {
    let schema = AvroSchema::parse_str(schema_text).unwrap();
    let mut payload = vec![0];
    payload.extend_from_slice(&schema_id.to_be_bytes());
    payload.extend(apache_avro::to_avro_datum(&schema, value).unwrap());
    payload
}

#[derive(Debug, Clone)]
enum StubBehavior {
    Succeed,
    Fail(String),
    Panic,
    Sleep(Duration),
}

/// Scenario with scripted relevance and outcome that counts its calls.
#[derive(Debug)]
pub struct StubScenario {
    state: ScenarioState,
    relevant: bool,
    adds_meta: bool,
    behavior: StubBehavior,
    relevance_calls: AtomicUsize,
    processed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for StubScenario {
    fn default() -> Self {
        Self {
            state: ScenarioState::default(),
            relevant: true,
            adds_meta: true,
            behavior: StubBehavior::Succeed,
            relevance_calls: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl StubScenario {
    /// An initialized scenario that accepts every event.
    pub fn relevant(name: &str, entity: &str) -> Self {
        let mut stub = Self::default();
        stub.state
            .init(name, &EntityConfig::new(entity, &format!("{}-topic", entity)));
        stub
    }

    /// An initialized scenario that rejects every event.
    pub fn irrelevant(name: &str, entity: &str) -> Self {
        Self {
            relevant: false,
            ..Self::relevant(name, entity)
        }
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.behavior = StubBehavior::Fail(reason.to_string());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = StubBehavior::Panic;
        self
    }

    pub fn sleeping(mut self, duration: Duration) -> Self {
        self.behavior = StubBehavior::Sleep(duration);
        self
    }

    pub fn without_meta(mut self) -> Self {
        self.adds_meta = false;
        self
    }

    pub fn relevance_calls(&self) -> usize {
        self.relevance_calls.load(Ordering::SeqCst)
    }

    /// Number of completed successful runs.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Scenario for StubScenario {
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
        self.adds_meta
    }

    fn is_relevant_event(&self, _message: &CollectedMessage) -> bool {
        self.relevance_calls.fetch_add(1, Ordering::SeqCst);
        self.relevant && self.is_running()
    }

    async fn process_message(
        &self,
        _message: FilteredMessage,
        _history: Arc<MessageStore>,
    ) -> Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);

        match &self.behavior {
            StubBehavior::Succeed => {}
            StubBehavior::Fail(reason) => {
                return Err(InterceptorError::Scenario {
                    name: self.name().to_string(),
                    message: reason.clone(),
                }
                .into())
            }
            StubBehavior::Panic => panic!("stub scenario {} panicked", self.name()),
            StubBehavior::Sleep(duration) => tokio::time::sleep(*duration).await,
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.state.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_message_has_changes() {
        let message = changed_message("orders", "1", 4, &[("status", "A", "B"), ("total", "1", "1")]);
        assert_eq!(message.action(), CdcAction::Changed);
        assert_eq!(message.changed_fields().len(), 1);
        assert!(message.has_changed("status"));
    }

    #[test]
    fn test_stub_counts_relevance_calls() {
        let stub = StubScenario::irrelevant("a", "orders");
        let message = filtered_message("orders", 1);
        assert!(!stub.is_relevant_event(&message));
        assert_eq!(stub.relevance_calls(), 1);
        assert_eq!(stub.entity_name(), "orders");
    }
}
