//! ---
//! lmp_section: "01-core-functionality"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Shared primitives for the chaos engine runtime."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Shared configuration and logging primitives for the Log Management
//! Platform chaos engine. Every other crate in the workspace reads its
//! settings through [`AppConfig`].

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, ChaosConfig, ClusterConfig, CommandTemplate, EffectConfig,
    HealthStatus, LoadedAppConfig, LoggingConfig, MetricsConfig, RollbackAction,
    ScenarioCategory, ScenarioConfig, Severity,
};
pub use logging::{init_tracing, LogFormat};
