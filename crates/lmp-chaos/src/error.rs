//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use crate::cluster::ClusterError;
use crate::record::InjectionId;

/// Result alias used throughout the chaos crate.
pub type Result<T> = std::result::Result<T, ChaosError>;

/// Error type for the chaos engine.
#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    /// A scenario with the same identifier is already registered.
    #[error("scenario '{0}' is already registered")]
    DuplicateScenario(String),
    /// No scenario is registered under the identifier.
    #[error("scenario '{0}' not found")]
    ScenarioNotFound(String),
    /// No open or finalized incident carries the identifier.
    #[error("incident {0} not found")]
    IncidentNotFound(InjectionId),
    /// The scenario's target already has an open injection.
    #[error("target '{target}' is busy with an open injection of scenario '{scenario}'")]
    TargetBusy {
        /// Target that rejected the trigger.
        target: String,
        /// Scenario currently holding the target.
        scenario: String,
    },
    /// The effect never took hold; nothing was left open.
    #[error("injection of scenario '{scenario}' failed after {attempts} attempt(s): {source}")]
    InjectionFailed {
        /// Scenario that could not be applied.
        scenario: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last error reported by the control surface.
        source: ClusterError,
    },
    /// A finalized record with the same identifier was already appended.
    #[error("incident {0} was already finalized")]
    AlreadyFinalized(InjectionId),
    /// Only finalized records may enter the incident log.
    #[error("incident {0} is still open")]
    RecordOpen(InjectionId),
    /// Scenario definition failed validation.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    /// IO failure while reading or writing the incident log.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure for incident records.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A spawned engine task panicked or was cancelled.
    #[error("engine task failed: {0}")]
    TaskFailed(String),
    /// Prometheus registration failure.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ChaosError {
    /// True for lookups that found nothing (scenario or incident).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChaosError::ScenarioNotFound(_) | ChaosError::IncidentNotFound(_)
        )
    }

    /// True when the request conflicts with current state and may be retried later.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ChaosError::TargetBusy { .. } | ChaosError::AlreadyFinalized(_)
        )
    }
}
