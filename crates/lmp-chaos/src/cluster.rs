//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lmp_common::config::{HealthStatus, ScenarioCategory, Severity};
use serde::{Deserialize, Serialize};

/// Errors reported by the cluster capability set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The cluster or control plane could not be reached.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    /// The request did not complete in time.
    #[error("cluster request timed out after {0:?}")]
    Timeout(Duration),
    /// The control surface refused the effect.
    #[error("effect rejected: {0}")]
    Rejected(String),
    /// HTTP transport or decoding failure.
    #[error("http error: {0}")]
    Http(String),
    /// A control command exited unsuccessfully.
    #[error("command failed: {0}")]
    Command(String),
}

/// Point-in-time view of cluster health. Consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealthSnapshot {
    /// When the probe answered.
    pub observed_at: DateTime<Utc>,
    /// Reported cluster colour.
    pub status: HealthStatus,
    /// Targets currently considered unhealthy.
    #[serde(default)]
    pub unhealthy_targets: BTreeSet<String>,
}

impl ClusterHealthSnapshot {
    /// Snapshot with the given colour and no unhealthy targets.
    pub fn new(status: HealthStatus) -> Self {
        Self {
            observed_at: Utc::now(),
            status,
            unhealthy_targets: BTreeSet::new(),
        }
    }

    /// Green snapshot with nothing unhealthy.
    pub fn green() -> Self {
        Self::new(HealthStatus::Green)
    }

    /// Mark additional targets as unhealthy.
    pub fn with_unhealthy<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unhealthy_targets
            .extend(targets.into_iter().map(Into::into));
        self
    }

    /// True when the target itself is not reported unhealthy.
    pub fn target_healthy(&self, target: &str) -> bool {
        !self.unhealthy_targets.contains(target)
    }

    /// Healthy means the colour meets the threshold and the target is not listed.
    pub fn is_healthy_for(&self, target: &str, threshold: HealthStatus) -> bool {
        self.status >= threshold && self.target_healthy(target)
    }
}

/// Effect parameters forwarded to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Scenario the effect belongs to.
    pub scenario_id: String,
    /// Scenario category.
    pub category: ScenarioCategory,
    /// Requested severity.
    pub severity: Severity,
    /// How long the effect should last, when bounded.
    pub duration: Option<Duration>,
    /// Free-form settings from the scenario definition.
    pub settings: IndexMap<String, String>,
}

/// Capability set the engine consumes from the cluster under test.
///
/// `health` must be side-effect free. `revert_effect` must be idempotent:
/// reverting a target with nothing applied is not an error.
#[async_trait]
pub trait ClusterControl: Send + Sync + 'static {
    /// Health as seen for a specific target.
    async fn health(&self, target: &str) -> Result<ClusterHealthSnapshot, ClusterError>;

    /// Whole-cluster health, used by operator status endpoints.
    async fn overview(&self) -> Result<ClusterHealthSnapshot, ClusterError>;

    /// Apply an effect to the target.
    async fn apply_effect(&self, target: &str, effect: &Effect) -> Result<(), ClusterError>;

    /// Revert whatever effect is active on the target.
    async fn revert_effect(&self, target: &str) -> Result<(), ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_and_target_both_gate_health() {
        let snapshot = ClusterHealthSnapshot::new(HealthStatus::Yellow).with_unhealthy(["es2"]);
        assert!(snapshot.is_healthy_for("es1", HealthStatus::Yellow));
        assert!(!snapshot.is_healthy_for("es1", HealthStatus::Green));
        assert!(!snapshot.is_healthy_for("es2", HealthStatus::Red));
        assert!(snapshot.target_healthy("es1"));
    }
}
