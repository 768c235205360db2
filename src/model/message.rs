//! Decoded change events.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use super::action::CdcAction;
use super::meta::{MessageMeta, MetaHandle};
use super::value::FieldDelta;

/// A decoded CDC event: action, key, offset, per-field deltas and meta.
///
/// Identity fields are immutable after construction. The set of changed
/// field names is computed lazily and invalidated on [`insert_field`].
///
/// [`insert_field`]: CollectedMessage::insert_field
#[derive(Debug)]
pub struct CollectedMessage {
    entity_name: String,
    message_key: String,
    offset: i64,
    action: CdcAction,
    fields: BTreeMap<String, FieldDelta>,
    changed_fields: OnceLock<Vec<String>>,
    meta: MetaHandle,
}

impl CollectedMessage {
    pub fn new(
        action: CdcAction,
        entity_name: impl Into<String>,
        offset: i64,
        offset_timestamp: Option<DateTime<Utc>>,
        message_key: impl Into<String>,
        fields: impl IntoIterator<Item = FieldDelta>,
    ) -> Self {
        let entity_name = entity_name.into();
        let message_key = message_key.into();
        let meta = MessageMeta::new(
            action,
            entity_name.clone(),
            offset,
            offset_timestamp,
            message_key.clone(),
        );
        Self {
            entity_name,
            message_key,
            offset,
            action,
            fields: fields
                .into_iter()
                .map(|f| (f.name().to_string(), f))
                .collect(),
            changed_fields: OnceLock::new(),
            meta: MetaHandle::new(meta),
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn message_key(&self) -> &str {
        &self.message_key
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn action(&self) -> CdcAction {
        self.action
    }

    pub fn meta(&self) -> &MetaHandle {
        &self.meta
    }

    /// Fields ordered by name.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDelta> {
        self.fields.values()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDelta> {
        self.fields.get(name)
    }

    /// Adds or replaces a field and resets the changed-fields cache.
    pub fn insert_field(&mut self, delta: FieldDelta) {
        self.fields.insert(delta.name().to_string(), delta);
        self.changed_fields = OnceLock::new();
    }

    /// Current (after, else before) value rendered as text.
    pub fn field_as_string(&self, name: &str) -> Option<String> {
        self.field(name)
            .and_then(FieldDelta::current)
            .map(ToString::to_string)
    }

    /// Current value as an integer, `null_value` when missing or non-integer.
    pub fn field_as_i64(&self, name: &str, null_value: Option<i64>) -> Option<i64> {
        self.field(name)
            .and_then(FieldDelta::current)
            .and_then(|v| v.as_i64())
            .or(null_value)
    }

    /// Current value as a float, `null_value` when missing or non-float.
    pub fn field_as_f64(&self, name: &str, null_value: Option<f64>) -> Option<f64> {
        self.field(name)
            .and_then(FieldDelta::current)
            .and_then(|v| v.as_f64())
            .or(null_value)
    }

    fn changed_names(&self) -> &[String] {
        self.changed_fields.get_or_init(|| {
            self.fields
                .values()
                .filter(|f| f.is_changed())
                .map(|f| f.name().to_string())
                .collect()
        })
    }

    /// Fields whose changed flag is set.
    pub fn changed_fields(&self) -> Vec<&FieldDelta> {
        self.changed_names()
            .iter()
            .filter_map(|name| self.fields.get(name))
            .collect()
    }

    pub fn has_changed(&self, name: &str) -> bool {
        self.changed_names().iter().any(|n| n == name)
    }

    /// True when at least one name is given and every one has changed.
    pub fn has_all_changed(&self, names: &[&str]) -> bool {
        !names.is_empty() && names.iter().all(|n| self.has_changed(n))
    }

    /// True when `other` carries the same current value for `name`.
    pub fn compare_field_with_other(&self, name: &str, other: &CollectedMessage) -> bool {
        let mine = self.field(name).and_then(FieldDelta::current);
        let theirs = other.field(name).and_then(FieldDelta::current);
        mine == theirs
    }

    /// Current field values as a JSON object.
    pub fn payload_as_json(&self) -> Value {
        let mut object = Map::new();
        for field in self.fields.values() {
            object.insert(
                field.name().to_string(),
                field.current().map(|v| v.to_json()).unwrap_or(Value::Null),
            );
        }
        Value::Object(object)
    }

    /// Multi-line rendering with every field and its transition.
    pub fn to_extended_string(&self) -> String {
        let mut out = format!(
            "{}{} key={} offset={} fields={}",
            self.action.symbol(),
            self.entity_name,
            self.message_key,
            self.offset,
            self.fields.len()
        );
        for field in self.fields.values() {
            out.push_str(&format!(
                "\n  {}{} {}",
                if field.is_changed() { "*" } else { " " },
                field.name(),
                field.transition("null")
            ));
        }
        out
    }
}

impl fmt::Display for CollectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} key={} offset={} changed=[{}]",
            self.action.symbol(),
            self.entity_name,
            self.message_key,
            self.offset,
            self.changed_names().join(", ")
        )
    }
}

/// An event that passed the filter stage.
///
/// Cheap to clone; clones share the underlying event and its meta.
#[derive(Debug, Clone)]
pub struct FilteredMessage {
    inner: Arc<CollectedMessage>,
}

impl FilteredMessage {
    pub fn new(message: CollectedMessage) -> Self {
        Self {
            inner: Arc::new(message),
        }
    }

    pub fn from_shared(message: Arc<CollectedMessage>) -> Self {
        Self { inner: message }
    }

    pub fn shared(&self) -> &Arc<CollectedMessage> {
        &self.inner
    }
}

impl Deref for FilteredMessage {
    type Target = CollectedMessage;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Display for FilteredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
