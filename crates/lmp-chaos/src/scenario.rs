//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use lmp_common::config::{EffectConfig, RollbackAction, ScenarioCategory, ScenarioConfig};
use serde::Serialize;
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::cluster::Effect;
use crate::error::{ChaosError, Result};

/// Immutable scenario definition. Shared by reference once registered.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    /// Unique identifier.
    pub id: String,
    /// Failure category.
    pub category: ScenarioCategory,
    /// Node or service the effect lands on.
    pub target: String,
    /// Effect parameters.
    pub effect: EffectConfig,
    /// How the effect is undone.
    pub rollback: RollbackAction,
    /// Periodic trigger interval; `None` means on demand only.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "interval_secs")]
    pub interval: Option<Duration>,
}

impl Scenario {
    /// Effect handed to the control surface.
    pub fn effect(&self) -> Effect {
        Effect {
            scenario_id: self.id.clone(),
            category: self.category,
            severity: self.effect.severity,
            duration: self.effect.duration,
            settings: self.effect.settings.clone(),
        }
    }

    /// Self-revert delay for `revert-after-duration` scenarios.
    pub fn self_revert_after(&self) -> Option<Duration> {
        match self.rollback {
            RollbackAction::RevertAfterDuration => self.effect.duration,
            RollbackAction::Revert => None,
        }
    }

    /// True when the scheduler should trigger this scenario periodically.
    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}

impl TryFrom<ScenarioConfig> for Scenario {
    type Error = ChaosError;

    fn try_from(config: ScenarioConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| ChaosError::InvalidScenario(err.to_string()))?;
        Ok(Self {
            id: config.id,
            category: config.category,
            target: config.target,
            effect: config.effect,
            rollback: config.rollback,
            interval: config.interval,
        })
    }
}

/// Registry of scenario definitions keyed by identifier, in registration order.
#[derive(Debug, Default, Clone)]
pub struct ScenarioRegistry {
    scenarios: IndexMap<String, Arc<Scenario>>,
}

impl ScenarioRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured scenarios, rejecting duplicates.
    pub fn from_config(configs: &[ScenarioConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Scenario::try_from(config.clone())?)?;
        }
        Ok(registry)
    }

    /// Register a scenario. Identifiers are unique.
    pub fn register(&mut self, scenario: Scenario) -> Result<Arc<Scenario>> {
        if self.scenarios.contains_key(&scenario.id) {
            return Err(ChaosError::DuplicateScenario(scenario.id));
        }
        debug!(
            target: "lmp::chaos::scenario",
            scenario = %scenario.id,
            category = %scenario.category,
            target_node = %scenario.target,
            "registered scenario"
        );
        let scenario = Arc::new(scenario);
        self.scenarios
            .insert(scenario.id.clone(), Arc::clone(&scenario));
        Ok(scenario)
    }

    /// Look a scenario up by identifier.
    pub fn lookup(&self, id: &str) -> Result<Arc<Scenario>> {
        self.scenarios
            .get(id)
            .cloned()
            .ok_or_else(|| ChaosError::ScenarioNotFound(id.to_string()))
    }

    /// Iterate scenarios in registration order.
    pub fn list(&self) -> impl ExactSizeIterator<Item = &Arc<Scenario>> + '_ {
        self.scenarios.values()
    }

    /// Scenarios carrying a periodic interval.
    pub fn periodic(&self) -> impl Iterator<Item = &Arc<Scenario>> + '_ {
        self.scenarios.values().filter(|scenario| scenario.is_periodic())
    }

    /// Number of registered scenarios.
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
