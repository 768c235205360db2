//! Factory map from scenario type names to constructors.
//!
//! Every configured scenario is created through its type's factory and
//! bound to its entity when the pipeline is built, so an unknown type or a
//! bad parameter fails the startup instead of the first event.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::field_change::FieldChangeScenario;
use super::logger::LoggerScenario;
use super::request_reply::RequestReplyScenario;
use super::{Scenario, ScenarioSet};
use crate::broker::Broker;
use crate::config::{EntityConfig, ScenarioDefinition};
use crate::error::{InterceptorError, Result};
use crate::response::ResponseRegistry;

/// Collaborators available to scenario factories.
#[derive(Clone)]
pub struct ScenarioContext {
    pub broker: Arc<dyn Broker>,
    pub responses: Arc<ResponseRegistry>,
}

impl ScenarioContext {
    pub fn new(broker: Arc<dyn Broker>, responses: Arc<ResponseRegistry>) -> Self {
        Self { broker, responses }
    }
}

pub type ScenarioFactory =
    Box<dyn Fn(&ScenarioDefinition, &ScenarioContext) -> Result<Box<dyn Scenario>> + Send + Sync>;

/// Registered scenario types.
///
/// # Examples
///
/// ```
/// use cdc_interceptor::scenario::ScenarioRegistry;
///
/// let registry = ScenarioRegistry::with_builtin();
/// assert!(registry.contains("logger"));
/// assert!(!registry.contains("nope"));
/// ```
#[derive(Default)]
pub struct ScenarioRegistry {
    factories: BTreeMap<String, ScenarioFactory>,
}

impl ScenarioRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in scenario types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LoggerScenario::TYPE_NAME, |definition, _| {
            Ok(Box::new(LoggerScenario::from_definition(definition)?))
        });
        registry.register(FieldChangeScenario::TYPE_NAME, |definition, _| {
            Ok(Box::new(FieldChangeScenario::from_definition(definition)?))
        });
        registry.register(RequestReplyScenario::TYPE_NAME, |definition, context| {
            Ok(Box::new(RequestReplyScenario::from_definition(
                definition, context,
            )?))
        });
        registry
    }

    pub fn register<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&ScenarioDefinition, &ScenarioContext) -> Result<Box<dyn Scenario>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(type_name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Creates and initializes one scenario for `entity`.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::UnknownScenario` for unregistered types and
    /// `InterceptorError::Scenario` when the factory or `init` fails.
    pub fn create(
        &self,
        definition: &ScenarioDefinition,
        entity: &EntityConfig,
        context: &ScenarioContext,
    ) -> Result<Arc<dyn Scenario>> {
        let factory = self.factories.get(&definition.scenario_type).ok_or_else(|| {
            InterceptorError::UnknownScenario {
                name: definition.name.clone(),
                scenario_type: definition.scenario_type.clone(),
            }
        })?;

        let scenario_error = |e: anyhow::Error| InterceptorError::Scenario {
            name: definition.name.clone(),
            message: e.to_string(),
        };
        let mut scenario = factory(definition, context).map_err(scenario_error)?;
        scenario
            .init(&definition.name, entity)
            .map_err(scenario_error)?;

        info!(
            scenario = %definition.name,
            scenario_type = %definition.scenario_type,
            entity = %entity.name,
            running = scenario.is_running(),
            "Scenario loaded"
        );
        Ok(Arc::from(scenario))
    }

    /// Creates every scenario of every entity.
    ///
    /// # Errors
    ///
    /// Fails on the first scenario that cannot be created.
    pub fn instantiate_all(
        &self,
        entities: &[EntityConfig],
        context: &ScenarioContext,
    ) -> Result<ScenarioSet> {
        let set = ScenarioSet::new();
        for entity in entities {
            set.replace_entity(&entity.name, Vec::new());
            for definition in &entity.scenarios {
                set.insert(self.create(definition, entity, context)?);
            }
        }
        Ok(set)
    }

    /// Checks that every configured scenario type is registered.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::UnknownScenario` for the first unknown type.
    pub fn validate(&self, entities: &[EntityConfig]) -> Result<()> {
        for entity in entities {
            for definition in &entity.scenarios {
                if !self.contains(&definition.scenario_type) {
                    return Err(InterceptorError::UnknownScenario {
                        name: definition.name.clone(),
                        scenario_type: definition.scenario_type.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}
