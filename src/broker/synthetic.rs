//! Synthetic Debezium feed for memory mode.
//!
//! For entities with test toggles set, publishes one envelope per
//! `processing_delay_ms`, cycling through the enabled kinds: a CREATED row
//! with a fresh id, a CHANGED row moving the newest live row to its next
//! status, and a DELETED row removing the oldest live row.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::memory::MemoryBroker;
use crate::config::EntityConfig;
use crate::model::CdcAction;

const STATUSES: [&str; 4] = ["NEW", "PLANNED", "ACTIVE", "DONE"];

pub struct SyntheticFeed {
    broker: MemoryBroker,
    entity: String,
    topic: String,
    interval: Duration,
    kinds: Vec<CdcAction>,
    next_id: i64,
    live: BTreeMap<i64, usize>,
}

impl SyntheticFeed {
    /// Feed for `entity`, or `None` when none of its test toggles is set.
    pub fn new(broker: MemoryBroker, entity: &EntityConfig) -> Option<Self> {
        let mut kinds = Vec::new();
        if entity.test_creations {
            kinds.push(CdcAction::Created);
        }
        if entity.test_changes {
            kinds.push(CdcAction::Changed);
        }
        if entity.test_deletions {
            kinds.push(CdcAction::Deleted);
        }
        if kinds.is_empty() {
            return None;
        }
        Some(Self {
            broker,
            entity: entity.name.clone(),
            topic: entity.topic.clone(),
            interval: entity.processing_delay().max(Duration::from_millis(1)),
            kinds,
            next_id: 1,
            live: BTreeMap::new(),
        })
    }

    /// Starts the feed on the current runtime if the entity asks for one.
    pub fn spawn(
        broker: MemoryBroker,
        entity: &EntityConfig,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let feed = Self::new(broker, entity)?;
        Some(tokio::spawn(feed.run(cancel)))
    }

    fn row(id: i64, status: usize) -> Value {
        json!({
            "id": id,
            "status": STATUSES[status % STATUSES.len()],
            "revision": status,
        })
    }

    /// Envelope for the next event of `kind`, updating the live rows.
    fn next_envelope(&mut self, kind: CdcAction) -> (i64, Value) {
        match kind {
            CdcAction::Created => self.create(),
            CdcAction::Changed => match self.live.iter().next_back() {
                Some((&id, &status)) => {
                    self.live.insert(id, status + 1);
                    (
                        id,
                        json!({"before": Self::row(id, status), "after": Self::row(id, status + 1), "op": "u"}),
                    )
                }
                None => self.create(),
            },
            CdcAction::Deleted => match self.live.pop_first() {
                Some((id, status)) => (
                    id,
                    json!({"before": Self::row(id, status), "after": null, "op": "d"}),
                ),
                None => self.create(),
            },
        }
    }

    fn create(&mut self) -> (i64, Value) {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, 0);
        (id, json!({"before": null, "after": Self::row(id, 0), "op": "c"}))
    }

    /// Publishes until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(entity = %self.entity, topic = %self.topic, kinds = ?self.kinds, "Synthetic feed started");
        let mut round = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let kind = self.kinds[round % self.kinds.len()];
            round += 1;
            let (id, envelope) = self.next_envelope(kind);
            let key = json!({"id": id}).to_string();
            let offset = self.broker.publish_json(&self.topic, Some(&key), &envelope);
            debug!(entity = %self.entity, id, offset, action = %kind, "Synthetic event published");
        }
        info!(entity = %self.entity, "Synthetic feed stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(creations: bool, changes: bool, deletions: bool) -> EntityConfig {
        let mut entity = EntityConfig::new("orders", "orders-topic").with_processing_delay_ms(5);
        entity.test_creations = creations;
        entity.test_changes = changes;
        entity.test_deletions = deletions;
        entity
    }

    #[test]
    fn test_no_toggles_no_feed() {
        assert!(SyntheticFeed::new(MemoryBroker::new(), &entity(false, false, false)).is_none());
    }

    #[test]
    fn test_cycle_create_change_delete() {
        let mut feed = SyntheticFeed::new(MemoryBroker::new(), &entity(true, true, true)).unwrap();

        let (id, created) = feed.next_envelope(CdcAction::Created);
        assert_eq!(id, 1);
        assert!(created["before"].is_null());

        let (id, changed) = feed.next_envelope(CdcAction::Changed);
        assert_eq!(id, 1);
        assert_eq!(changed["before"]["status"], "NEW");
        assert_eq!(changed["after"]["status"], "PLANNED");

        let (id, deleted) = feed.next_envelope(CdcAction::Deleted);
        assert_eq!(id, 1);
        assert!(deleted["after"].is_null());
        assert!(feed.live.is_empty());
    }

    #[test]
    fn test_change_without_rows_creates_one() {
        let mut feed = SyntheticFeed::new(MemoryBroker::new(), &entity(false, true, false)).unwrap();
        let (_, envelope) = feed.next_envelope(CdcAction::Changed);
        assert_eq!(envelope["op"], "c");
        let (_, envelope) = feed.next_envelope(CdcAction::Changed);
        assert_eq!(envelope["op"], "u");
    }

    #[tokio::test]
    async fn test_spawned_feed_publishes_until_cancelled() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let handle = SyntheticFeed::spawn(broker.clone(), &entity(true, false, false), cancel.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let published = broker.record_count("orders-topic");
        assert!(published > 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.record_count("orders-topic"), published);
    }
}
