//! Collector: turns raw broker records into [`CollectedMessage`]s.
//!
//! Records are expected to carry a Debezium-style JSON envelope with
//! `before`/`after` row images, optionally wrapped together with its schema
//! as `{"schema": ..., "payload": ...}`. Confluent-framed Avro payloads and
//! keys are decoded with the writer schema registered under their schema id
//! into the same shape. The event key is the first field of an object key, or
//! the key text itself.

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::broker::{BrokerError, BrokerRecord, RecordConsumer, SharedProgress};
use crate::config::EntityConfig;
use crate::error::InterceptorError;
use crate::model::{CdcAction, CollectedMessage, FieldDelta, FieldValue};
use crate::schema::{confluent_frame, SchemaResolver, WireSchema, WriterSchema};
use crate::telemetry;

/// Reads one entity's topic and decodes its records.
pub struct Collector {
    entity_name: String,
    consumer: Box<dyn RecordConsumer>,
    schemas: Arc<dyn SchemaResolver>,
}

impl Collector {
    pub fn new(
        entity: &EntityConfig,
        consumer: Box<dyn RecordConsumer>,
        schemas: Arc<dyn SchemaResolver>,
    ) -> Self {
        Self {
            entity_name: entity.name.clone(),
            consumer,
            schemas,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }

    pub fn progress(&self) -> SharedProgress {
        self.consumer.progress()
    }

    /// Polls until at least one record arrives and returns the decoded batch.
    ///
    /// Records that fail to decode are logged and skipped, so the batch may
    /// be shorter than the poll result (or empty if every record failed).
    ///
    /// # Errors
    ///
    /// Returns the broker error when a poll fails.
    pub async fn collect_messages(&mut self) -> Result<Vec<CollectedMessage>, BrokerError> {
        loop {
            let records = self.consumer.poll().await?;
            if records.is_empty() {
                trace!(entity = %self.entity_name, "No records in poll interval");
                continue;
            }

            info!(
                entity = %self.entity_name,
                count = records.len(),
                first_offset = records[0].offset,
                "Received records"
            );

            let mut collected = Vec::with_capacity(records.len());
            for record in &records {
                if record.payload.is_none() {
                    debug!(entity = %self.entity_name, offset = record.offset, "Skipping tombstone");
                    continue;
                }
                match self.decode_record(record).await {
                    Ok(message) => collected.push(message),
                    Err(e) => {
                        error!(
                            entity = %self.entity_name,
                            topic = %record.topic,
                            offset = record.offset,
                            error = %e,
                            "Failed to decode record"
                        );
                        telemetry::record_decode_failure(&self.entity_name);
                    }
                }
            }
            telemetry::record_collected(&self.entity_name, collected.len());
            return Ok(collected);
        }
    }

    /// Decodes one record without touching the consumer.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::Decode` for missing or malformed payloads
    /// and envelopes with neither image, and `InterceptorError::Schema` when
    /// the schema resolver fails or knows no writer schema for an Avro record.
    pub async fn decode_record(
        &self,
        record: &BrokerRecord,
    ) -> Result<CollectedMessage, InterceptorError> {
        let payload = record
            .payload
            .as_deref()
            .ok_or_else(|| InterceptorError::Decode("record has no payload".to_string()))?;
        let (envelope, writer_row) = match confluent_frame(payload) {
            Some((id, datum)) => {
                let writer = self.writer_schema(id).await?;
                (writer.decode(datum)?, writer.row())
            }
            None => {
                let envelope: Value = serde_json::from_slice(payload).map_err(|e| {
                    InterceptorError::Decode(format!("invalid JSON envelope: {}", e))
                })?;
                (envelope, None)
            }
        };
        let (body, inline_schema) = split_envelope(&envelope);

        let before = row_image(body, "before");
        let after = row_image(body, "after");
        let action = CdcAction::from_presence(before.is_some(), after.is_some()).ok_or_else(
            || InterceptorError::Decode("envelope has neither before nor after".to_string()),
        )?;
        let section = if after.is_some() { "after" } else { "before" };

        let declared = writer_row.or_else(|| {
            inline_schema
                .and_then(|s| WireSchema::from_debezium(s, section))
                .map(Arc::new)
        });
        let schema = match declared {
            Some(schema) => schema,
            None => match self
                .schemas
                .resolve(&record.topic)
                .await
                .map_err(|e| InterceptorError::Schema(e.to_string()))?
            {
                Some(schema) => schema,
                None => {
                    let row = after.or(before).map(WireSchema::infer).unwrap_or_default();
                    Arc::new(row)
                }
            },
        };

        let fields = schema.fields().iter().map(|field| {
            let decode = |image: Option<&Map<String, Value>>| {
                image
                    .and_then(|row| row.get(&field.name))
                    .and_then(|v| FieldValue::decode(field.field_type, v))
            };
            FieldDelta::new(
                field.name.clone(),
                field.field_type,
                decode(before),
                decode(after),
            )
        });

        let key = self.record_key(record.key.as_deref()).await?;
        let offset_timestamp = record
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(CollectedMessage::new(
            action,
            self.entity_name.clone(),
            record.offset,
            offset_timestamp,
            key,
            fields,
        ))
    }

    async fn writer_schema(&self, id: u32) -> Result<Arc<WriterSchema>, InterceptorError> {
        self.schemas
            .writer_schema(id)
            .await
            .map_err(|e| InterceptorError::Schema(e.to_string()))?
            .ok_or_else(|| {
                InterceptorError::Schema(format!("no writer schema registered under id {}", id))
            })
    }

    async fn record_key(&self, raw: Option<&[u8]>) -> Result<String, InterceptorError> {
        match raw.and_then(confluent_frame) {
            Some((id, datum)) => Ok(key_text(&self.writer_schema(id).await?.decode(datum)?)),
            None => Ok(decode_key(raw)),
        }
    }

    /// Asks the consumer to resume after a failed poll.
    pub async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.consumer.reconnect().await
    }

    pub async fn close(&mut self) {
        self.consumer.close().await;
    }
}

fn split_envelope(envelope: &Value) -> (&Value, Option<&Value>) {
    match (envelope.get("schema"), envelope.get("payload")) {
        (Some(schema), Some(payload)) if payload.is_object() => (payload, Some(schema)),
        _ => (envelope, None),
    }
}

fn row_image<'a>(body: &'a Value, section: &str) -> Option<&'a Map<String, Value>> {
    body.get(section).and_then(Value::as_object)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Event key from the raw record key.
///
/// JSON object keys (optionally wrapped with their schema) yield their first
/// field; JSON scalars yield their text; anything else is read as UTF-8.
pub fn decode_key(raw: Option<&[u8]>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    match serde_json::from_slice::<Value>(raw) {
        Ok(key) => key_text(&key),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

fn key_text(key: &Value) -> String {
    let (body, _) = split_envelope(key);
    match body {
        Value::Object(map) => map.values().next().map(scalar_to_string).unwrap_or_default(),
        Value::Null => String::new(),
        other => scalar_to_string(other),
    }
}
