//! Per-event processing metadata.
//!
//! Every collected event carries a [`MessageMeta`]: identity (entity, key,
//! offset, action), an ordered list of named timestamps recorded as the event
//! moves through the pipeline, a progress label, and a severity-ordered
//! result. Scenarios running concurrently on the same event share one meta
//! through a [`MetaHandle`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::action::CdcAction;

/// Timestamp of the broker offset (producer/log-append time)
pub const TS_OFFSET: &str = "offset-read";
/// Collector decoded the record
pub const TS_RECEIVED: &str = "received";
/// All scenario work for this event finished
pub const TS_DONE: &str = "done";
/// Prefix for scenario start checkpoints, suffixed with the scenario name
pub const TS_START_PREFIX: &str = "scenario-start:";
/// Prefix for scenario end checkpoints, suffixed with the scenario name
pub const TS_END_PREFIX: &str = "scenario-end:";
/// Prefix for checkpoints recorded when a scenario reads external state
pub const TS_READ_PREFIX: &str = "read:";
/// Prefix for outbound request checkpoints
pub const TS_SEND_PREFIX: &str = "send:";
/// Prefix for inbound response checkpoints
pub const TS_RECV_PREFIX: &str = "recv:";

/// Severity of a processing result; ordered `Ok < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultLevel {
    Ok,
    Warn,
    Error,
}

impl ResultLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ResultLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result level with an optional message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub level: ResultLevel,
    pub message: Option<String>,
}

impl ResultEntry {
    pub fn new(level: ResultLevel, message: Option<String>) -> Self {
        Self { level, message }
    }

    pub fn ok() -> Self {
        Self::new(ResultLevel::Ok, None)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Warn, Some(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultLevel::Error, Some(message.into()))
    }

    /// Merges `level`/`message` into `current` when `level` is not lower.
    ///
    /// A missing new message keeps the previous text. Returns the message
    /// that ends up stored.
    pub fn merge_when_higher(
        current: &mut Option<ResultEntry>,
        level: ResultLevel,
        message: Option<String>,
    ) -> Option<String> {
        match current {
            None => {
                *current = Some(ResultEntry::new(level, message));
            }
            Some(entry) if level >= entry.level => {
                entry.level = level;
                if message.is_some() {
                    entry.message = message;
                }
            }
            Some(_) => {}
        }
        current.as_ref().and_then(|e| e.message.clone())
    }
}

impl fmt::Display for ResultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.level, message),
            None => write!(f, "{}", self.level),
        }
    }
}

/// Processing metadata for one event.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    entity_name: String,
    message_key: String,
    offset: i64,
    action: CdcAction,
    timestamps: Vec<(String, DateTime<Utc>)>,
    progress: Option<String>,
    result: Option<ResultEntry>,
    entity_values: Vec<Option<String>>,
}

impl MessageMeta {
    /// Creates the meta and records the offset and received checkpoints.
    ///
    /// When the broker supplied no record timestamp the offset checkpoint
    /// uses the receive time.
    pub fn new(
        action: CdcAction,
        entity_name: impl Into<String>,
        offset: i64,
        offset_timestamp: Option<DateTime<Utc>>,
        message_key: impl Into<String>,
    ) -> Self {
        let received = Utc::now();
        let mut meta = Self {
            entity_name: entity_name.into(),
            message_key: message_key.into(),
            offset,
            action,
            timestamps: Vec::new(),
            progress: None,
            result: None,
            entity_values: Vec::new(),
        };
        meta.add_timestamp_at(TS_OFFSET, offset_timestamp.unwrap_or(received));
        meta.add_timestamp_at(TS_RECEIVED, received);
        meta
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

    /// `<symbol><entity>`, e.g. `*orders`.
    pub fn action_entity(&self) -> String {
        format!("{}{}", self.action.symbol(), self.entity_name)
    }

    /// Records `key` at the current time.
    pub fn add_timestamp(&mut self, key: impl Into<String>) {
        self.add_timestamp_at(key, Utc::now());
    }

    /// Records `prefix + name` at the current time.
    pub fn add_timestamp_with_prefix(&mut self, prefix: &str, name: &str) {
        self.add_timestamp(format!("{}{}", prefix, name));
    }

    /// Records `key` at `ts` and makes it the current progress label.
    ///
    /// Re-recording an existing key overwrites its time but keeps its
    /// position in the ordering.
    pub fn add_timestamp_at(&mut self, key: impl Into<String>, ts: DateTime<Utc>) {
        let key = key.into();
        match self.timestamps.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = ts,
            None => self.timestamps.push((key.clone(), ts)),
        }
        self.progress = Some(key);
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.timestamps
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, ts)| *ts)
    }

    /// Formatted timestamp, or `-` when the checkpoint is missing.
    pub fn timestamp_as_string(&self, key: &str) -> String {
        self.timestamp(key)
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn timestamps(&self) -> &[(String, DateTime<Utc>)] {
        &self.timestamps
    }

    /// Milliseconds between the earliest and latest recorded checkpoints.
    pub fn duration_ms(&self) -> i64 {
        let earliest = self.timestamps.iter().map(|(_, ts)| *ts).min();
        let latest = self.timestamps.iter().map(|(_, ts)| *ts).max();
        match (earliest, latest) {
            (Some(first), Some(last)) => (last - first).num_milliseconds(),
            _ => 0,
        }
    }

    /// Name of the most recently recorded checkpoint.
    pub fn progress(&self) -> Option<&str> {
        self.progress.as_deref()
    }

    pub fn result(&self) -> Option<&ResultEntry> {
        self.result.as_ref()
    }

    /// Highest level recorded so far, `Ok` when nothing was recorded.
    pub fn worst_level(&self) -> ResultLevel {
        self.result.as_ref().map(|r| r.level).unwrap_or(ResultLevel::Ok)
    }

    /// Replaces the result when `level` is at least the current level.
    ///
    /// A `None` text keeps the existing message. Returns the stored message.
    pub fn set_result_when_higher(
        &mut self,
        level: ResultLevel,
        text: Option<String>,
    ) -> Option<String> {
        ResultEntry::merge_when_higher(&mut self.result, level, text)
    }

    pub fn set_result_entry_when_higher(&mut self, entry: ResultEntry) -> Option<String> {
        self.set_result_when_higher(entry.level, entry.message)
    }

    /// Stores a scenario-supplied display value at `index`.
    ///
    /// Returns the previous value at that slot.
    pub fn set_entity_values(&mut self, index: usize, text: impl Into<String>) -> Option<String> {
        if self.entity_values.len() <= index {
            self.entity_values.resize(index + 1, None);
        }
        self.entity_values[index].replace(text.into())
    }

    pub fn entity_values(&self, index: usize) -> Option<&str> {
        self.entity_values.get(index).and_then(|v| v.as_deref())
    }

    /// All populated values joined as `[a, b]`, or `None` if there are none.
    pub fn all_entity_values(&self) -> Option<String> {
        let values: Vec<&str> = self
            .entity_values
            .iter()
            .filter_map(|v| v.as_deref())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(format!("[{}]", values.join(", ")))
        }
    }

    /// Multi-line checkpoint table, optionally with per-step deltas.
    pub fn timestamps_table(&self, show_deltas: bool) -> String {
        let mut lines = Vec::with_capacity(self.timestamps.len());
        let mut previous: Option<DateTime<Utc>> = None;
        for (key, ts) in &self.timestamps {
            let mut line = format!("{:<32} {}", key, ts.format("%H:%M:%S%.3f"));
            if show_deltas {
                if let Some(prev) = previous {
                    line.push_str(&format!(" (+{} ms)", (*ts - prev).num_milliseconds()));
                }
            }
            previous = Some(*ts);
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl fmt::Display for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} key={} offset={} progress={} duration={}ms",
            self.action_entity(),
            self.message_key,
            self.offset,
            self.progress.as_deref().unwrap_or("-"),
            self.duration_ms()
        )?;
        if let Some(result) = &self.result {
            write!(f, " result={}", result)?;
        }
        Ok(())
    }
}

/// Shared, lockable handle to a [`MessageMeta`].
///
/// Clones point at the same meta; identity comparison uses the pointer.
#[derive(Debug, Clone)]
pub struct MetaHandle(Arc<Mutex<MessageMeta>>);

impl MetaHandle {
    pub fn new(meta: MessageMeta) -> Self {
        Self(Arc::new(Mutex::new(meta)))
    }

    /// Locks the meta, recovering the data if a holder panicked.
    pub fn lock(&self) -> MutexGuard<'_, MessageMeta> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point-in-time copy of the meta.
    pub fn snapshot(&self) -> MessageMeta {
        self.lock().clone()
    }

    /// True when both handles refer to the same meta.
    pub fn same_as(&self, other: &MetaHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn meta() -> MessageMeta {
        MessageMeta::new(CdcAction::Changed, "orders", 7, None, "42")
    }

    #[test]
    fn test_new_records_offset_and_received() {
        let meta = meta();
        assert!(meta.timestamp(TS_OFFSET).is_some());
        assert!(meta.timestamp(TS_RECEIVED).is_some());
        assert_eq!(meta.progress(), Some(TS_RECEIVED));
        assert_eq!(meta.action_entity(), "*orders");
    }

    #[test]
    fn test_duration_spans_first_and_last() {
        let start = Utc::now() - Duration::seconds(10);
        let mut meta = MessageMeta::new(CdcAction::Created, "orders", 1, Some(start), "k");
        meta.add_timestamp_at(TS_DONE, start + Duration::milliseconds(2500));
        assert!(meta.duration_ms() >= 2500);
        assert_eq!(meta.progress(), Some(TS_DONE));
    }

    #[test]
    fn test_readding_timestamp_keeps_position() {
        let mut meta = meta();
        meta.add_timestamp("a");
        meta.add_timestamp("b");
        meta.add_timestamp("a");
        let keys: Vec<&str> = meta.timestamps().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![TS_OFFSET, TS_RECEIVED, "a", "b"]);
        assert_eq!(meta.progress(), Some("a"));
    }

    #[test]
    fn test_result_only_escalates() {
        let mut meta = meta();
        meta.set_result_when_higher(ResultLevel::Warn, Some("slow".to_string()));
        meta.set_result_when_higher(ResultLevel::Ok, Some("fine".to_string()));
        assert_eq!(meta.worst_level(), ResultLevel::Warn);
        assert_eq!(meta.result().unwrap().message.as_deref(), Some("slow"));

        meta.set_result_when_higher(ResultLevel::Error, Some("boom".to_string()));
        assert_eq!(meta.worst_level(), ResultLevel::Error);
        assert_eq!(meta.result().unwrap().message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_result_without_text_keeps_previous_message() {
        let mut meta = meta();
        meta.set_result_when_higher(ResultLevel::Warn, Some("slow".to_string()));
        let stored = meta.set_result_when_higher(ResultLevel::Error, None);
        assert_eq!(stored.as_deref(), Some("slow"));
        assert_eq!(meta.worst_level(), ResultLevel::Error);
    }

    #[test]
    fn test_ok_after_error_is_ignored() {
        let mut meta = meta();
        meta.set_result_when_higher(ResultLevel::Error, Some("failed".to_string()));
        meta.set_result_when_higher(ResultLevel::Ok, None);
        assert_eq!(meta.worst_level(), ResultLevel::Error);
    }

    #[test]
    fn test_entity_values() {
        let mut meta = meta();
        assert_eq!(meta.all_entity_values(), None);
        meta.set_entity_values(1, "second");
        assert_eq!(meta.entity_values(0), None);
        assert_eq!(meta.entity_values(1), Some("second"));
        let previous = meta.set_entity_values(1, "replaced");
        assert_eq!(previous.as_deref(), Some("second"));
        meta.set_entity_values(0, "first");
        assert_eq!(meta.all_entity_values().as_deref(), Some("[first, replaced]"));
    }

    #[test]
    fn test_timestamps_table_with_deltas() {
        let start = Utc::now();
        let mut meta = MessageMeta::new(CdcAction::Created, "orders", 1, Some(start), "k");
        meta.add_timestamp_at("step", start + Duration::milliseconds(1500));
        let table = meta.timestamps_table(true);
        assert!(table.contains(TS_OFFSET));
        assert!(table.contains("step"));
        assert!(table.contains("ms)"));
    }

    #[test]
    fn test_missing_timestamp_renders_dash() {
        assert_eq!(meta().timestamp_as_string(TS_DONE), "-");
    }

    #[test]
    fn test_handle_identity() {
        let a = MetaHandle::new(meta());
        let b = a.clone();
        let c = MetaHandle::new(meta());
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        b.lock().add_timestamp(TS_DONE);
        assert!(a.snapshot().timestamp(TS_DONE).is_some());
    }

    #[test]
    fn test_result_level_ordering() {
        assert!(ResultLevel::Ok < ResultLevel::Warn);
        assert!(ResultLevel::Warn < ResultLevel::Error);
    }
}
