//! Schema resolution for CDC envelopes
//!
//! A record's column list and types are resolved in this order:
//!
//! 1. the schema embedded in a Debezium JSON envelope (`{"schema", "payload"}`)
//! 2. the configured [`SchemaResolver`] for the record's topic
//! 3. inference from the JSON row image itself
//!
//! [`HttpSchemaRegistry`] talks to a Confluent-compatible registry, looking up
//! the latest `<topic>-value` subject and caching the parsed Avro schema.
//!
//! Records in the Confluent wire format (`0x00`, a big-endian schema id, an
//! Avro datum) are decoded with the writer schema registered under that id,
//! see [`confluent_frame`] and [`WriterSchema`].

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::{InterceptorError, Result};
use crate::model::FieldType;

/// One column of a row image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered column list of an entity's row image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireSchema {
    fields: Vec<SchemaField>,
}

impl WireSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Derives a schema from a JSON row image.
    pub fn infer(row: &Map<String, Value>) -> Self {
        Self::new(
            row.iter()
                .map(|(name, value)| SchemaField::new(name.clone(), FieldType::infer(value)))
                .collect(),
        )
    }

    /// Extracts the row schema of `section` ("before" or "after") from a
    /// Debezium/Kafka Connect JSON envelope schema.
    pub fn from_debezium(schema: &Value, section: &str) -> Option<Self> {
        let row = schema
            .get("fields")?
            .as_array()?
            .iter()
            .find(|f| f.get("field").and_then(Value::as_str) == Some(section))?;
        let fields = row
            .get("fields")?
            .as_array()?
            .iter()
            .filter_map(|f| {
                let name = f.get("field")?.as_str()?;
                let wire_type = f.get("type").and_then(Value::as_str).unwrap_or("");
                Some(SchemaField::new(name, FieldType::from_wire(wire_type)))
            })
            .collect();
        Some(Self::new(fields))
    }

    /// Parses an Avro record schema.
    ///
    /// For a Debezium envelope the row record nested in the `after` (or
    /// `before`) union is used; a plain record is taken as the row itself.
    pub fn from_avro(schema: &Value) -> Option<Self> {
        let fields = schema.get("fields")?.as_array()?;
        let row = ["after", "before"].iter().find_map(|section| {
            fields
                .iter()
                .find(|f| f.get("name").and_then(Value::as_str) == Some(*section))
                .and_then(|f| avro_record(f.get("type")?))
        });
        let row_fields = match row {
            Some(record) => record.get("fields")?.as_array()?,
            None => fields,
        };
        Some(Self::new(
            row_fields
                .iter()
                .filter_map(|f| {
                    let name = f.get("name")?.as_str()?;
                    Some(SchemaField::new(name, avro_field_type(f.get("type")?)))
                })
                .collect(),
        ))
    }
}

fn avro_record(avro_type: &Value) -> Option<&Value> {
    match avro_type {
        Value::Array(variants) => variants.iter().find_map(avro_record),
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("record") => {
            Some(avro_type)
        }
        _ => None,
    }
}

fn avro_field_type(avro_type: &Value) -> FieldType {
    match avro_type {
        Value::String(name) => FieldType::from_wire(name),
        Value::Array(variants) => variants
            .iter()
            .find(|v| v.as_str() != Some("null"))
            .map(avro_field_type)
            .unwrap_or(FieldType::Other),
        Value::Object(obj) => {
            if obj.contains_key("logicalType") {
                return FieldType::Other;
            }
            obj.get("type")
                .map(avro_field_type)
                .unwrap_or(FieldType::Other)
        }
        _ => FieldType::Other,
    }
}

const CONFLUENT_MAGIC: u8 = 0;

/// Splits a Confluent-framed payload into its schema id and Avro datum.
///
/// Returns `None` for anything else, JSON text included.
pub fn confluent_frame(payload: &[u8]) -> Option<(u32, &[u8])> {
    match payload {
        [CONFLUENT_MAGIC, a, b, c, d, datum @ ..] => {
            Some((u32::from_be_bytes([*a, *b, *c, *d]), datum))
        }
        _ => None,
    }
}

/// Avro schema a producer wrote records with, as registered under `id`.
#[derive(Debug)]
pub struct WriterSchema {
    id: u32,
    avro: AvroSchema,
    row: Option<Arc<WireSchema>>,
}

impl WriterSchema {
    /// Parses the registry's schema text.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::Schema` when the text is not a valid Avro
    /// schema.
    pub fn parse(id: u32, text: &str) -> Result<Self> {
        let avro = AvroSchema::parse_str(text).map_err(|e| {
            InterceptorError::Schema(format!("invalid Avro schema {}: {}", id, e))
        })?;
        let row = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|json| WireSchema::from_avro(&json))
            .map(Arc::new);
        Ok(Self { id, avro, row })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Row columns, when the schema is a record.
    pub fn row(&self) -> Option<Arc<WireSchema>> {
        self.row.clone()
    }

    /// Decodes one Avro datum into JSON; records become objects, unions
    /// their branch value, bytes base64 text.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::Decode` when the datum does not match the
    /// schema.
    pub fn decode(&self, datum: &[u8]) -> std::result::Result<Value, InterceptorError> {
        let mut reader = datum;
        let value = apache_avro::from_avro_datum(&self.avro, &mut reader, None).map_err(|e| {
            InterceptorError::Decode(format!("invalid Avro datum for schema {}: {}", self.id, e))
        })?;
        Ok(avro_to_json(value))
    }
}

fn avro_to_json(value: AvroValue) -> Value {
    match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(n) | AvroValue::Date(n) | AvroValue::TimeMillis(n) => Value::from(n),
        AvroValue::Long(n)
        | AvroValue::TimeMicros(n)
        | AvroValue::TimestampMillis(n)
        | AvroValue::TimestampMicros(n) => Value::from(n),
        AvroValue::Float(n) => Value::from(n),
        AvroValue::Double(n) => Value::from(n),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Bytes(b) | AvroValue::Fixed(_, b) => Value::String(BASE64.encode(b)),
        AvroValue::Union(_, inner) => avro_to_json(*inner),
        AvroValue::Array(items) => Value::Array(items.into_iter().map(avro_to_json).collect()),
        AvroValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(name, v)| (name, avro_to_json(v)))
                .collect(),
        ),
        AvroValue::Record(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(name, v)| (name, avro_to_json(v)))
                .collect(),
        ),
        other => Value::try_from(other).unwrap_or(Value::Null),
    }
}

/// Looks up the row schema for a topic.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Returns `Ok(None)` when the resolver has no schema for `topic`.
    async fn resolve(&self, topic: &str) -> Result<Option<Arc<WireSchema>>>;

    /// Writer schema registered under a Confluent schema id.
    ///
    /// Returns `Ok(None)` when the resolver does not know the id.
    async fn writer_schema(&self, _id: u32) -> Result<Option<Arc<WriterSchema>>> {
        Ok(None)
    }
}

/// Resolver that never knows a schema; every record falls back to inference.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSchemaRegistry;

#[async_trait]
impl SchemaResolver for NoSchemaRegistry {
    async fn resolve(&self, _topic: &str) -> Result<Option<Arc<WireSchema>>> {
        Ok(None)
    }
}

/// Fixed topic-to-schema and id-to-writer-schema maps.
#[derive(Debug, Default)]
pub struct StaticSchemaRegistry {
    schemas: HashMap<String, Arc<WireSchema>>,
    writers: HashMap<u32, Arc<WriterSchema>>,
}

impl StaticSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, topic: &str, schema: WireSchema) -> Self {
        self.schemas.insert(topic.to_string(), Arc::new(schema));
        self
    }

    pub fn with_writer_schema(mut self, schema: WriterSchema) -> Self {
        self.writers.insert(schema.id(), Arc::new(schema));
        self
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaRegistry {
    async fn resolve(&self, topic: &str) -> Result<Option<Arc<WireSchema>>> {
        Ok(self.schemas.get(topic).cloned())
    }

    async fn writer_schema(&self, id: u32) -> Result<Option<Arc<WriterSchema>>> {
        Ok(self.writers.get(&id).cloned())
    }
}

/// Body of both `/subjects/.../versions/latest` and `/schemas/ids/{id}`.
#[derive(Debug, Deserialize)]
struct RegisteredSchema {
    schema: String,
}

/// Confluent-compatible schema registry client with per-topic and per-id
/// caches.
pub struct HttpSchemaRegistry {
    base_url: String,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, Arc<WireSchema>>>,
    writers: RwLock<HashMap<u32, Arc<WriterSchema>>>,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, topic: &str) -> Option<Arc<WireSchema>> {
        self.cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .cloned()
    }

    fn subject_url(&self, topic: &str) -> String {
        format!(
            "{}/subjects/{}-value/versions/latest",
            self.base_url, topic
        )
    }
}

#[async_trait]
impl SchemaResolver for HttpSchemaRegistry {
    async fn resolve(&self, topic: &str) -> Result<Option<Arc<WireSchema>>> {
        if let Some(schema) = self.cached(topic) {
            return Ok(Some(schema));
        }

        let url = self.subject_url(topic);
        debug!(url = %url, "Fetching schema from registry");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(topic = %topic, "No schema registered");
            return Ok(None);
        }
        let version: RegisteredSchema = response.error_for_status()?.json().await?;
        let avro: Value = serde_json::from_str(&version.schema)?;
        let schema = WireSchema::from_avro(&avro).ok_or_else(|| {
            InterceptorError::Schema(format!("unsupported schema for subject {}-value", topic))
        })?;
        let schema = Arc::new(schema);

        info!(
            topic = %topic,
            fields = schema.fields().len(),
            "Cached schema from registry"
        );
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(topic.to_string(), schema.clone());
        Ok(Some(schema))
    }

    async fn writer_schema(&self, id: u32) -> Result<Option<Arc<WriterSchema>>> {
        let cached = self
            .writers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned();
        if let Some(schema) = cached {
            return Ok(Some(schema));
        }

        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        debug!(url = %url, "Fetching writer schema from registry");
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(schema_id = id, "No schema registered under id");
            return Ok(None);
        }
        let registered: RegisteredSchema = response.error_for_status()?.json().await?;
        let schema = Arc::new(WriterSchema::parse(id, &registered.schema)?);

        info!(schema_id = id, "Cached writer schema from registry");
        self.writers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, schema.clone());
        Ok(Some(schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        avro_order_create, confluent_payload, ORDER_ENVELOPE_SCHEMA,
    };
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn debezium_schema() -> Value {
        json!({
            "type": "struct",
            "fields": [
                {"type": "struct", "field": "before", "optional": true, "fields": [
                    {"type": "int32", "field": "id", "optional": false},
                    {"type": "string", "field": "status", "optional": true}
                ]},
                {"type": "struct", "field": "after", "optional": true, "fields": [
                    {"type": "int32", "field": "id", "optional": false},
                    {"type": "string", "field": "status", "optional": true}
                ]},
                {"type": "string", "field": "op", "optional": false}
            ]
        })
    }

    fn avro_envelope() -> Value {
        json!({
            "type": "record",
            "name": "Envelope",
            "fields": [
                {"name": "before", "type": ["null", {
                    "type": "record",
                    "name": "Value",
                    "fields": [
                        {"name": "id", "type": "long"},
                        {"name": "status", "type": ["null", "string"], "default": null},
                        {"name": "amount", "type": ["null", "double"]},
                        {"name": "updated", "type": {"type": "long", "logicalType": "timestamp-millis"}}
                    ]
                }], "default": null},
                {"name": "after", "type": ["null", "Value"], "default": null},
                {"name": "op", "type": "string"}
            ]
        })
    }

    #[test]
    fn test_from_debezium_schema() {
        let schema = WireSchema::from_debezium(&debezium_schema(), "after").unwrap();
        assert_eq!(
            schema.fields(),
            &[
                SchemaField::new("id", FieldType::Int),
                SchemaField::new("status", FieldType::String)
            ]
        );
        assert!(WireSchema::from_debezium(&debezium_schema(), "source").is_none());
    }

    #[test]
    fn test_from_avro_envelope_uses_row_record() {
        let schema = WireSchema::from_avro(&avro_envelope()).unwrap();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.field("id").unwrap().field_type, FieldType::Long);
        assert_eq!(schema.field("status").unwrap().field_type, FieldType::String);
        assert_eq!(schema.field("amount").unwrap().field_type, FieldType::Double);
        assert_eq!(schema.field("updated").unwrap().field_type, FieldType::Other);
    }

    #[test]
    fn test_from_avro_plain_record() {
        let schema = WireSchema::from_avro(&json!({
            "type": "record",
            "name": "Row",
            "fields": [{"name": "flag", "type": "boolean"}]
        }))
        .unwrap();
        assert_eq!(schema.fields(), &[SchemaField::new("flag", FieldType::Boolean)]);
    }

    #[test]
    fn test_infer_keeps_row_order() {
        let row = json!({"z": 1, "a": "x"});
        let schema = WireSchema::infer(row.as_object().unwrap());
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn test_static_registry() {
        let registry = StaticSchemaRegistry::new().with_schema(
            "orders",
            WireSchema::new(vec![SchemaField::new("id", FieldType::Long)]),
        );
        assert!(registry.resolve("orders").await.unwrap().is_some());
        assert!(registry.resolve("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_registry_fetches_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subjects/orders-value/versions/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subject": "orders-value",
                "version": 3,
                "id": 17,
                "schema": avro_envelope().to_string()
            })))
            .expect(1)
            .mount(&server)
            .await;

        let registry = HttpSchemaRegistry::new(&server.uri());
        let first = registry.resolve("orders").await.unwrap().unwrap();
        let second = registry.resolve("orders").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.fields().len(), 4);
    }

    #[test]
    fn test_confluent_frame() {
        assert_eq!(
            confluent_frame(&[0, 0, 0, 0, 7, 2, 4]),
            Some((7, &[2u8, 4][..]))
        );
        assert_eq!(confluent_frame(&[0, 0, 1, 0, 0]), Some((65536, &[0u8; 0][..])));
        assert_eq!(confluent_frame(br#"{"after": {}}"#), None);
        assert_eq!(confluent_frame(&[0, 0, 0]), None);
    }

    #[test]
    fn test_writer_schema_decodes_datum() {
        let writer = WriterSchema::parse(7, ORDER_ENVELOPE_SCHEMA).unwrap();
        assert_eq!(writer.row().unwrap().field("total").unwrap().field_type, FieldType::Double);

        let payload = confluent_payload(7, ORDER_ENVELOPE_SCHEMA, avro_order_create(5, "NEW"));
        let (id, datum) = confluent_frame(&payload).unwrap();
        assert_eq!(id, 7);
        assert_eq!(
            writer.decode(datum).unwrap(),
            json!({
                "before": null,
                "after": {"id": 5, "status": "NEW", "total": 10.5},
                "op": "c"
            })
        );
        assert!(matches!(writer.decode(&[0xff]), Err(InterceptorError::Decode(_))));
    }

    #[test]
    fn test_writer_schema_rejects_invalid_text() {
        assert!(WriterSchema::parse(1, r#"{"type": "record"}"#).is_err());
        assert!(WriterSchema::parse(2, r#""long""#).unwrap().row().is_none());
    }

    #[tokio::test]
    async fn test_http_registry_fetches_writer_schema_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schemas/ids/7"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"schema": ORDER_ENVELOPE_SCHEMA})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/schemas/ids/8"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry = HttpSchemaRegistry::new(&server.uri());
        let first = registry.writer_schema(7).await.unwrap().unwrap();
        let second = registry.writer_schema(7).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), 7);
        assert!(registry.writer_schema(8).await.unwrap().is_none());
        assert!(NoSchemaRegistry.writer_schema(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_registry_missing_subject() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subjects/unknown-value/versions/latest"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry = HttpSchemaRegistry::new(&server.uri());
        assert!(registry.resolve("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_registry_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = HttpSchemaRegistry::new(&server.uri());
        assert!(registry.resolve("orders").await.is_err());
    }
}
