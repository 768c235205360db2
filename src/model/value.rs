//! Typed field values and per-field deltas.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire type of a column, as declared by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Long,
    Float,
    Double,
    Boolean,
    Bytes,
    /// Anything the decoder keeps as raw JSON (structs, arrays, logical types)
    Other,
}

impl FieldType {
    /// Maps an Avro or Debezium/Kafka Connect type name.
    pub fn from_wire(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "string" => Self::String,
            "int" | "int8" | "int16" | "int32" => Self::Int,
            "long" | "int64" => Self::Long,
            "float" | "float32" => Self::Float,
            "double" | "float64" => Self::Double,
            "boolean" | "bool" => Self::Boolean,
            "bytes" | "fixed" => Self::Bytes,
            _ => Self::Other,
        }
    }

    /// Best-effort type for a schemaless JSON value.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Long,
            Value::Number(_) => Self::Double,
            Value::String(_) => Self::String,
            _ => Self::Other,
        }
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl FieldValue {
    /// Decodes a JSON value according to the declared field type.
    ///
    /// JSON `null` decodes to `None`. Values that do not fit the declared
    /// type are kept as [`FieldValue::Json`] rather than rejected.
    pub fn decode(field_type: FieldType, value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        let decoded = match field_type {
            FieldType::Boolean => value.as_bool().map(Self::Boolean),
            FieldType::Int => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Self::Int),
            FieldType::Long => value.as_i64().map(Self::Long),
            FieldType::Float => value.as_f64().map(|n| Self::Float(n as f32)),
            FieldType::Double => value.as_f64().map(Self::Double),
            FieldType::String => Some(Self::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            FieldType::Bytes => value.as_str().map(|s| {
                Self::Bytes(
                    BASE64
                        .decode(s)
                        .unwrap_or_else(|_| s.as_bytes().to_vec()),
                )
            }),
            FieldType::Other => None,
        };
        Some(decoded.unwrap_or_else(|| Self::Json(value.clone())))
    }

    /// Converts the value back to JSON (bytes as base64).
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::Bool(*b),
            Self::Int(n) => Value::from(*n),
            Self::Long(n) => Value::from(*n),
            Self::Float(n) => Value::from(*n),
            Self::Double(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Bytes(b) => Value::String(BASE64.encode(b)),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of `Int` and `Long` values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(i64::from(*n)),
            Self::Long(n) => Some(*n),
            _ => None,
        }
    }

    /// Floating point view of `Float` and `Double` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(f64::from(*n)),
            Self::Double(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Long(n) => write!(f, "{}", n),
            Self::Float(n) => write!(f, "{}", n),
            Self::Double(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&BASE64.encode(b)),
            Self::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Before/after values of one column plus the derived change flags.
///
/// The flags are computed once at construction:
/// - `created`: no before value, an after value
/// - `deleted`: a before value, no after value
/// - `changed`: both present and unequal, or exactly one present
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDelta {
    name: String,
    field_type: FieldType,
    before: Option<FieldValue>,
    after: Option<FieldValue>,
    created: bool,
    changed: bool,
    deleted: bool,
}

impl FieldDelta {
    /// Creates a delta and derives its change flags.
    ///
    /// # Examples
    ///
    /// ```
    /// use cdc_interceptor::model::{FieldDelta, FieldType, FieldValue};
    ///
    /// let delta = FieldDelta::new(
    ///     "status",
    ///     FieldType::String,
    ///     Some(FieldValue::String("NEW".into())),
    ///     Some(FieldValue::String("DONE".into())),
    /// );
    /// assert!(delta.is_changed());
    /// assert!(!delta.is_created());
    /// ```
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        before: Option<FieldValue>,
        after: Option<FieldValue>,
    ) -> Self {
        let created = before.is_none() && after.is_some();
        let deleted = before.is_some() && after.is_none();
        let changed = match (&before, &after) {
            (Some(b), Some(a)) => b != a,
            (None, None) => false,
            _ => true,
        };
        Self {
            name: name.into(),
            field_type,
            before,
            after,
            created,
            changed,
            deleted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn before(&self) -> Option<&FieldValue> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&FieldValue> {
        self.after.as_ref()
    }

    /// The after value if present, otherwise the before value.
    pub fn current(&self) -> Option<&FieldValue> {
        self.after.as_ref().or(self.before.as_ref())
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Renders `before -> after`, substituting `null_value` for missing sides.
    pub fn transition(&self, null_value: &str) -> String {
        let render = |v: Option<&FieldValue>| {
            v.map(ToString::to_string)
                .unwrap_or_else(|| null_value.to_string())
        };
        format!("{} -> {}", render(self.before()), render(self.after()))
    }
}

impl fmt::Display for FieldDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}{}]",
            self.name,
            self.transition("null"),
            if self.changed { ", changed" } else { "" }
        )
    }
}
