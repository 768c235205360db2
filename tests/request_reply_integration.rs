//! Integration tests for the request/reply scenario over the broker
//!
//! An engine task answers requests on the response topic; the scenario
//! correlates replies by key and maps their status onto the event result.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use cdc_interceptor::broker::memory::MemoryBroker;
use cdc_interceptor::broker::Broker;
use cdc_interceptor::config::{BrokerMode, Config, EntityConfig, ScenarioDefinition};
use cdc_interceptor::decide::Decider;
use cdc_interceptor::latch::CountDownLatch;
use cdc_interceptor::model::ResultLevel;
use cdc_interceptor::scenario::ScenarioRegistry;
use cdc_interceptor::schema::NoSchemaRegistry;

use common::{publish_update, status_of};

const WAIT: Duration = Duration::from_secs(5);

/// Replies `error` for status `BLOCKED` and `ok` otherwise; ignores `SILENT`.
fn spawn_engine(broker: MemoryBroker) {
    tokio::spawn(async move {
        let mut consumer = broker.consumer("engine-requests", "engine").unwrap();
        while let Ok(records) = consumer.poll().await {
            for record in records {
                let request: Value = serde_json::from_slice(record.payload.as_deref().unwrap()).unwrap();
                let key = request["request_index"].as_str().unwrap().to_string();
                let reply = match status_of(&request["payload"]) {
                    Some("SILENT") => continue,
                    Some("BLOCKED") => json!({"request_index": key, "status": "error", "message": "blocked"}),
                    _ => json!({"request_index": key, "status": "ok"}),
                };
                broker.publish_json("engine-responses", None, &reply);
            }
        }
    });
}

fn config(timeout_ms: u64) -> Config {
    let mut config = Config::default();
    config.broker.mode = BrokerMode::Memory;
    config.decide.shutdown_grace_ms = 1000;
    config.response.retry_backoff_ms = 20;
    config.interceptor.entities.push(
        EntityConfig::new("orders", "orders-topic").with_scenario(
            ScenarioDefinition::new("engine", "request_reply")
                .with_param("request_topic", json!("engine-requests"))
                .with_param("response_topic", json!("engine-responses"))
                .with_param("timeout_ms", json!(timeout_ms)),
        ),
    );
    config
}

#[tokio::test]
async fn test_replies_map_to_event_results() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(20));
    spawn_engine(broker.clone());

    let latch = Arc::new(CountDownLatch::new(3));
    let mut decider = Decider::from_config(
        config(300),
        &ScenarioRegistry::with_builtin(),
        Arc::new(broker.clone()),
        Arc::new(NoSchemaRegistry),
    )
    .unwrap()
    .with_filter_latch("orders", latch.clone());
    decider.start().unwrap();

    publish_update(&broker, "orders-topic", 1, "NEW", "PAID");
    publish_update(&broker, "orders-topic", 2, "NEW", "BLOCKED");
    publish_update(&broker, "orders-topic", 3, "NEW", "SILENT");

    assert!(latch.wait_timeout(WAIT).await);
    assert!(decider.wait_until_idle(WAIT).await);

    let stored = decider.stored_messages("orders");
    assert_eq!(stored.len(), 3);

    let paid = stored[0].meta().snapshot();
    assert_eq!(paid.worst_level(), ResultLevel::Ok);
    assert_eq!(paid.entity_values(0), Some("status=ok"));
    assert!(paid.timestamp("recv:engine").is_some());

    let blocked = stored[1].meta().snapshot();
    assert_eq!(blocked.worst_level(), ResultLevel::Error);
    assert_eq!(
        blocked.result().unwrap().message.as_deref(),
        Some("engine: status=error: blocked")
    );

    let silent = stored[2].meta().snapshot();
    assert_eq!(silent.worst_level(), ResultLevel::Warn);
    assert!(silent.timestamp("send:engine").is_some());
    assert!(silent.timestamp("recv:engine").is_none());

    assert_eq!(broker.record_count("engine-requests"), 3);
    assert!(decider.status_report().contains("Response connectors:"));

    decider.shutdown().await;
}
