//! Pipeline metrics
//!
//! Counters, histograms and gauges emitted through the `metrics` facade.
//! Nothing is exported unless a recorder is installed, for instance by
//! [`init_metrics_exporter`] with the `prometheus` feature.
//!
//! # Metrics
//!
//! - `interceptor_records_collected_total`: records decoded per entity
//! - `interceptor_decode_failures_total`: records skipped because decoding failed
//! - `interceptor_collect_failures_total`: failed collect cycles per entity
//! - `interceptor_events_enqueued_total`: relevant events handed to the decide stage
//! - `interceptor_events_evicted_total`: history entries dropped by limits
//! - `interceptor_queue_depth`: shared queue length
//! - `interceptor_scenario_invocations_total`: scenario runs by status
//! - `interceptor_scenario_duration_seconds`: scenario run time
//! - `interceptor_scenario_active_count`: scenario runs in flight
//! - `interceptor_orphan_responses_total`: responses without a waiting request
//!
//! # Examples
//!
//! ```
//! use cdc_interceptor::telemetry::ScenarioMetrics;
//!
//! let metrics = ScenarioMetrics::new("orders", "audit");
//! metrics.record_completion("ok");
//! ```

use metrics::{counter, decrement_gauge, gauge, histogram, increment_counter, increment_gauge};
use std::time::Instant;

pub fn record_collected(entity: &str, count: usize) {
    counter!(
        "interceptor_records_collected_total",
        count as u64,
        "entity" => entity.to_string()
    );
}

pub fn record_decode_failure(entity: &str) {
    increment_counter!("interceptor_decode_failures_total", "entity" => entity.to_string());
}

pub fn record_collect_failure(entity: &str) {
    increment_counter!("interceptor_collect_failures_total", "entity" => entity.to_string());
}

pub fn record_enqueued(entity: &str) {
    increment_counter!("interceptor_events_enqueued_total", "entity" => entity.to_string());
}

pub fn record_evicted(entity: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "interceptor_events_evicted_total",
        count as u64,
        "entity" => entity.to_string()
    );
}

pub fn record_queue_depth(depth: usize) {
    gauge!("interceptor_queue_depth", depth as f64);
}

pub fn record_orphan_response(topic: &str) {
    increment_counter!("interceptor_orphan_responses_total", "topic" => topic.to_string());
}

/// Metrics for one scenario invocation
///
/// Increments the active gauge on creation. Exactly one of
/// [`record_completion`](Self::record_completion) or a drop closes it, so
/// the gauge stays accurate even when the invocation is cancelled.
#[derive(Debug)]
pub struct ScenarioMetrics {
    entity: String,
    scenario: String,
    start: Instant,
    recorded: bool,
}

impl ScenarioMetrics {
    pub fn new(entity: &str, scenario: &str) -> Self {
        increment_gauge!(
            "interceptor_scenario_active_count",
            1.0,
            "entity" => entity.to_string()
        );
        Self {
            entity: entity.to_string(),
            scenario: scenario.to_string(),
            start: Instant::now(),
            recorded: false,
        }
    }

    /// Records the invocation outcome ("ok", "error", "panic").
    pub fn record_completion(mut self, status: &str) {
        self.recorded = true;
        histogram!(
            "interceptor_scenario_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "scenario" => self.scenario.clone(),
            "status" => status.to_string()
        );
        increment_counter!(
            "interceptor_scenario_invocations_total",
            "entity" => self.entity.clone(),
            "scenario" => self.scenario.clone(),
            "status" => status.to_string()
        );
        decrement_gauge!(
            "interceptor_scenario_active_count",
            1.0,
            "entity" => self.entity.clone()
        );
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for ScenarioMetrics {
    fn drop(&mut self) {
        if !self.recorded {
            decrement_gauge!(
                "interceptor_scenario_active_count",
                1.0,
                "entity" => self.entity.clone()
            );
        }
    }
}

/// Initializes the metrics exporter for Prometheus
///
/// With the `prometheus` feature this installs the Prometheus exporter on
/// its default listen address. Without it, this is a no-op.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_metrics_record() {
        let metrics = ScenarioMetrics::new("orders", "audit");
        assert_eq!(metrics.scenario(), "audit");
        metrics.record_completion("ok");
    }

    #[test]
    fn test_scenario_metrics_drop_without_record() {
        let metrics = ScenarioMetrics::new("orders", "audit");
        assert!(metrics.elapsed().as_secs() < 5);
        drop(metrics);
    }

    #[test]
    fn test_free_functions_without_recorder() {
        record_collected("orders", 3);
        record_decode_failure("orders");
        record_collect_failure("orders");
        record_enqueued("orders");
        record_evicted("orders", 0);
        record_evicted("orders", 2);
        record_queue_depth(4);
        record_orphan_response("responses");
    }

    #[test]
    fn test_init_metrics_exporter_is_safe() {
        init_metrics_exporter();
    }
}
