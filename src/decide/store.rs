//! Bounded per-entity history of relevant events.
//!
//! Each entity owns a FIFO list behind its own lock, so entities never
//! contend with each other. After every append the list is trimmed from the
//! oldest end until both the count bound and the age bound hold; the age is
//! measured between the "received" checkpoints of the oldest and newest
//! retained events. Readers receive snapshots.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EntityConfig;
use crate::model::meta::TS_RECEIVED;
use crate::model::{CollectedMessage, FieldValue, FilteredMessage};
use crate::telemetry;

/// Retention bounds of one entity's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    pub max_messages: usize,
    pub max_age: Duration,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_age: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&EntityConfig> for StorageLimits {
    fn from(entity: &EntityConfig) -> Self {
        Self {
            max_messages: entity.max_messages_in_storage,
            max_age: entity.max_time_in_storage(),
        }
    }
}

type History = Arc<Mutex<VecDeque<FilteredMessage>>>;

/// History of every entity, keyed by entity name.
#[derive(Debug, Default)]
pub struct MessageStore {
    limits: HashMap<String, StorageLimits>,
    default_limits: StorageLimits,
    entities: RwLock<HashMap<String, History>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the limits of each configured entity.
    pub fn from_entities(entities: &[EntityConfig]) -> Self {
        let mut store = Self::new();
        for entity in entities {
            store
                .limits
                .insert(entity.name.clone(), StorageLimits::from(entity));
        }
        store
    }

    pub fn with_limits(mut self, entity: &str, limits: StorageLimits) -> Self {
        self.limits.insert(entity.to_string(), limits);
        self
    }

    pub fn limits(&self, entity: &str) -> StorageLimits {
        self.limits
            .get(entity)
            .copied()
            .unwrap_or(self.default_limits)
    }

    fn history(&self, entity: &str) -> Option<History> {
        let map = self.entities.read().unwrap_or_else(|p| p.into_inner());
        map.get(entity).cloned()
    }

    fn history_or_create(&self, entity: &str) -> History {
        if let Some(history) = self.history(entity) {
            return history;
        }
        let mut map = self.entities.write().unwrap_or_else(|p| p.into_inner());
        map.entry(entity.to_string()).or_default().clone()
    }

    /// Appends `message` to its entity's history and enforces the limits.
    ///
    /// Returns the number of evicted events.
    pub fn store(&self, message: FilteredMessage) -> usize {
        let entity = message.entity_name().to_string();
        let offset = message.offset();
        let limits = self.limits(&entity);
        let history = self.history_or_create(&entity);

        let mut list = history.lock().unwrap_or_else(|p| p.into_inner());
        list.push_back(message);
        info!(entity = %entity, offset, size = list.len(), "Stored message");

        let mut evicted = 0;
        while list.len() > limits.max_messages || exceeds_max_age(&list, limits.max_age) {
            if let Some(oldest) = list.pop_front() {
                debug!(entity = %entity, offset = oldest.offset(), "Removing oldest message");
                evicted += 1;
            } else {
                break;
            }
        }
        drop(list);

        telemetry::record_evicted(&entity, evicted);
        evicted
    }

    /// Point-in-time copy of one entity's history, oldest first.
    pub fn snapshot(&self, entity: &str) -> Vec<FilteredMessage> {
        self.history(entity)
            .map(|history| {
                let list = history.lock().unwrap_or_else(|p| p.into_inner());
                list.iter().cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, entity: &str) -> usize {
        self.history(entity)
            .map(|history| history.lock().unwrap_or_else(|p| p.into_inner()).len())
            .unwrap_or(0)
    }

    /// History sizes per entity, sorted by entity name.
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        let map = self.entities.read().unwrap_or_else(|p| p.into_inner());
        map.iter()
            .map(|(entity, history)| {
                let len = history.lock().unwrap_or_else(|p| p.into_inner()).len();
                (entity.clone(), len)
            })
            .collect()
    }

    pub fn total_len(&self) -> usize {
        self.sizes().values().sum()
    }

    pub fn clear(&self) {
        let mut map = self.entities.write().unwrap_or_else(|p| p.into_inner());
        map.clear();
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.sizes().into_keys().collect()
    }

    pub fn find_by_entity(&self, entity: &str) -> Vec<FilteredMessage> {
        self.snapshot(entity)
    }

    /// Events of `entity` whose `field` has the after-value `value`.
    ///
    /// With `value` set to `None`, every event carrying the field matches.
    pub fn find_by_field(
        &self,
        entity: &str,
        field: &str,
        value: Option<&FieldValue>,
    ) -> Vec<FilteredMessage> {
        self.find_by_condition(entity, |message| match message.field(field) {
            Some(delta) => value.map_or(true, |v| delta.after() == Some(v)),
            None => false,
        })
    }

    pub fn find_by_condition<F>(&self, entity: &str, condition: F) -> Vec<FilteredMessage>
    where
        F: Fn(&CollectedMessage) -> bool,
    {
        self.snapshot(entity)
            .into_iter()
            .filter(|message| condition(&**message))
            .collect()
    }

    /// Matching events of all entities, grouped by entity name.
    pub fn search_across_entities<F>(&self, condition: F) -> Vec<FilteredMessage>
    where
        F: Fn(&CollectedMessage) -> bool,
    {
        self.entity_names()
            .iter()
            .flat_map(|entity| self.find_by_condition(entity, &condition))
            .collect()
    }

    /// Latest stored event of `entity` with `key` and an offset below `offset`.
    pub fn previous_for_key(&self, entity: &str, key: &str, offset: i64) -> Option<FilteredMessage> {
        self.find_by_condition(entity, |m| m.message_key() == key && m.offset() < offset)
            .into_iter()
            .max_by_key(|m| m.offset())
    }
}

fn received_at(message: &FilteredMessage) -> Option<DateTime<Utc>> {
    message.meta().lock().timestamp(TS_RECEIVED)
}

fn exceeds_max_age(list: &VecDeque<FilteredMessage>, max_age: Duration) -> bool {
    let (Some(oldest), Some(newest)) = (list.front(), list.back()) else {
        return false;
    };
    match (received_at(oldest), received_at(newest)) {
        (Some(oldest), Some(newest)) => (newest - oldest)
            .to_std()
            .map(|span| span > max_age)
            .unwrap_or(false),
        _ => false,
    }
}
