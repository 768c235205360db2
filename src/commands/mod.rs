/*!
Command handlers for the CLI

This module provides the handlers invoked by the CLI entrypoint:

- `run`: Start the filter/decide pipeline until Ctrl-C
- `validate`: Instantiate every configured scenario and report problems
- `scenarios`: List the registered scenario types

Handlers wire the library components together: broker, schema resolver,
scenario registry and the Decider.
*/

use crate::broker::kafka::KafkaBroker;
use crate::broker::memory::MemoryBroker;
use crate::broker::{Broker, BrokerError, KafkaClientConfig};
use crate::config::{BrokerMode, Config};
use crate::error::Result;
use crate::schema::{HttpSchemaRegistry, NoSchemaRegistry, SchemaResolver};
use std::sync::Arc;

/// Broker for the configured mode; the memory broker is returned twice so
/// callers can publish synthetic events into it.
pub fn build_broker(config: &Config) -> Result<(Arc<dyn Broker>, Option<MemoryBroker>)> {
    match config.broker.mode {
        BrokerMode::Memory => {
            let memory = MemoryBroker::new();
            Ok((Arc::new(memory.clone()), Some(memory)))
        }
        BrokerMode::Kafka => {
            let client = KafkaClientConfig::from_settings(&config.broker).map_err(BrokerError::from)?;
            Ok((Arc::new(KafkaBroker::new(client)), None))
        }
    }
}

pub fn build_schema_resolver(config: &Config) -> Arc<dyn SchemaResolver> {
    match &config.broker.schema_registry_url {
        Some(url) if config.broker.mode == BrokerMode::Kafka => {
            tracing::info!("Using schema registry at {}", url);
            Arc::new(HttpSchemaRegistry::new(url))
        }
        _ => Arc::new(NoSchemaRegistry),
    }
}

/// Run command handler
///
/// Starts the pipeline and logs a status report periodically until Ctrl-C.
pub mod r#run {
    use super::*;
    use crate::broker::synthetic::SyntheticFeed;
    use crate::decide::Decider;
    use crate::scenario::ScenarioRegistry;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Run the pipeline
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration (consumed)
    /// * `mock` - Force the in-memory broker with synthetic feeds
    /// * `status_interval_secs` - Seconds between status reports (0 disables)
    pub async fn run_pipeline(mut config: Config, mock: bool, status_interval_secs: u64) -> Result<()> {
        if mock {
            config.broker.mode = BrokerMode::Memory;
        }
        if config.interceptor.entities.is_empty() {
            tracing::warn!("No entities configured, nothing to intercept");
        }

        let (broker, memory) = build_broker(&config)?;
        let schemas = build_schema_resolver(&config);
        let registry = ScenarioRegistry::with_builtin();
        registry.validate(&config.interceptor.entities)?;

        let entities = config.interceptor.entities.clone();
        let mut decider = Decider::from_config(config, &registry, broker, schemas)?;

        let feed_cancel = CancellationToken::new();
        let feeds: Vec<_> = match &memory {
            Some(memory) => entities
                .iter()
                .filter_map(|entity| SyntheticFeed::spawn(memory.clone(), entity, feed_cancel.clone()))
                .collect(),
            None => Vec::new(),
        };

        decider.start()?;
        tracing::info!(
            entities = entities.len(),
            synthetic_feeds = feeds.len(),
            "Interceptor running, press Ctrl-C to stop"
        );

        let interval = (status_interval_secs > 0).then(|| Duration::from_secs(status_interval_secs));
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                    break;
                }
                _ = sleep_or_forever(interval) => {
                    tracing::info!("Status report:\n{}", decider.status_report());
                }
            }
        }

        tracing::info!("Stopping interceptor");
        feed_cancel.cancel();
        for feed in feeds {
            if let Err(e) = feed.await {
                tracing::warn!("Synthetic feed ended abnormally: {}", e);
            }
        }
        decider.shutdown().await;
        println!("{}", decider.status_report());
        Ok(())
    }

    async fn sleep_or_forever(interval: Option<Duration>) {
        match interval {
            Some(interval) => tokio::time::sleep(interval).await,
            None => std::future::pending().await,
        }
    }
}

/// Validate command handler
///
/// Instantiates every scenario against the in-memory broker, so no Kafka
/// connection is needed to check a configuration.
pub mod validate {
    use super::*;
    use crate::scenario::{ScenarioContext, ScenarioRegistry};
    use crate::response::ResponseRegistry;
    use std::time::Duration;

    pub async fn validate_config(config: &Config) -> Result<()> {
        config.validate()?;

        let registry = ScenarioRegistry::with_builtin();
        registry.validate(&config.interceptor.entities)?;

        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let responses = Arc::new(ResponseRegistry::new(broker.clone(), config.response.clone()));
        let context = ScenarioContext::new(broker, responses.clone());
        let scenarios = registry.instantiate_all(&config.interceptor.entities, &context);
        responses.shutdown_all(Duration::from_secs(1)).await;
        let scenarios = scenarios?;

        for entity in &config.interceptor.entities {
            println!("Entity {} (topic {})", entity.name, entity.topic);
            for scenario in scenarios.for_entity(&entity.name) {
                println!("  {}", scenario.describe());
            }
        }
        println!("Configuration is valid: {} scenario(s)", scenarios.len());
        Ok(())
    }

}

/// Scenarios command handler
pub mod scenarios {
    use crate::scenario::ScenarioRegistry;

    pub fn list_scenarios() {
        let registry = ScenarioRegistry::with_builtin();
        println!("Registered scenario types:");
        for name in registry.type_names() {
            println!("  {}", name);
        }
    }
}
