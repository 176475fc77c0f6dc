//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! The chaos engine injects failure scenarios into the log cluster, watches
//! the cluster recover and keeps an append-only record of every incident.
//!
//! The external cluster is reached only through [`ClusterControl`], so the
//! whole engine can be driven by test doubles.
#![warn(missing_docs)]

pub mod busy;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod incident_log;
pub mod injector;
pub mod metrics;
pub mod monitor;
pub mod record;
pub mod scenario;
pub mod scheduler;

pub use busy::{BusyTargets, TargetClaim};
pub use cluster::{ClusterControl, ClusterError, ClusterHealthSnapshot, Effect};
pub use engine::{ChaosEngine, ChaosEngineBuilder};
pub use error::{ChaosError, Result};
pub use incident_log::{IncidentFilter, IncidentLog, IncidentQuery};
pub use injector::{Injection, Injector, InjectorPolicy, RollbackOutcome};
pub use metrics::ChaosMetrics;
pub use monitor::{MonitorPolicy, RecoveryMonitor};
pub use record::{InjectionId, InjectionOutcome, InjectionRecord, TriggerSource};
pub use scenario::{Scenario, ScenarioRegistry};
pub use scheduler::{Scheduler, SchedulerHandle};

pub use lmp_common::config::{HealthStatus, RollbackAction, ScenarioCategory, Severity};

/// Crate prelude collecting the types needed to wire an engine.
pub mod prelude {
    pub use super::cluster::{ClusterControl, ClusterHealthSnapshot};
    pub use super::engine::{ChaosEngine, ChaosEngineBuilder};
    pub use super::incident_log::{IncidentFilter, IncidentLog};
    pub use super::record::{InjectionId, InjectionOutcome, InjectionRecord};
    pub use super::scenario::{Scenario, ScenarioRegistry};
    pub use super::scheduler::Scheduler;
}
