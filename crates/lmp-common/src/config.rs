//! ---
//! lmp_section: "01-core-functionality"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Shared primitives for the chaos engine runtime."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_api_title() -> String {
    "Log Management Platform API".to_owned()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_owned()]
}

fn default_elasticsearch_host() -> String {
    "http://localhost:9200".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shell() -> String {
    "sh".to_owned()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_health_retries() -> u32 {
    3
}

fn default_apply_attempts() -> u32 {
    3
}

fn default_apply_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_incident_log() -> Option<PathBuf> {
    Some(PathBuf::from("target/incidents/incidents.jsonl"))
}

/// Primary configuration object for the chaos engine daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "LMP_CONFIG";

    /// Load configuration from disk, respecting the `LMP_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the path it was read from.
    ///
    /// `LMP_CONFIG` wins over every candidate; otherwise the first candidate
    /// that exists on disk is used.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.elasticsearch_host.trim().is_empty() {
            return Err(anyhow!("cluster.elasticsearch_host must not be empty"));
        }
        for key in self.cluster.commands.keys() {
            key.parse::<ScenarioCategory>()
                .map_err(|_| anyhow!("cluster.commands has unknown category '{}'", key))?;
        }
        self.chaos.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Mirror every event into a daily rolling JSON file under `directory`.
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_api_title")]
    pub title: String,
    /// Allowed CORS origins; `["*"]` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_allow_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
            title: default_api_title(),
            cors_allow_origins: default_cors_origins(),
        }
    }
}

/// Shell command pair used to apply and revert an effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    pub apply: String,
    pub revert: String,
}

/// Connection settings for the cluster under test.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_elasticsearch_host")]
    pub elasticsearch_host: String,
    #[serde(rename = "request_timeout_secs", default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Node names expected in the cluster. Missing nodes are reported unhealthy.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Default apply/revert commands keyed by scenario category (`node-failure`, ...).
    #[serde(default)]
    pub commands: IndexMap<String, CommandTemplate>,
}

impl ClusterConfig {
    pub fn command_for(&self, category: ScenarioCategory) -> Option<&CommandTemplate> {
        self.commands.get(category.as_str())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            elasticsearch_host: default_elasticsearch_host(),
            request_timeout: default_request_timeout(),
            nodes: Vec::new(),
            shell: default_shell(),
            commands: IndexMap::new(),
        }
    }
}

/// Engine policy plus the scenario catalogue.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(rename = "poll_interval_ms", default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(rename = "recovery_timeout_secs", default = "default_recovery_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub recovery_timeout: Duration,
    /// Consecutive health probe failures tolerated before giving up.
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,
    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: u32,
    #[serde(rename = "apply_backoff_ms", default = "default_apply_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub apply_backoff: Duration,
    #[serde(default)]
    pub healthy_threshold: HealthStatus,
    /// JSON-lines file mirroring the incident log. `None` keeps it in memory.
    #[serde(default = "default_incident_log")]
    pub incident_log: Option<PathBuf>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            recovery_timeout: default_recovery_timeout(),
            health_retries: default_health_retries(),
            apply_attempts: default_apply_attempts(),
            apply_backoff: default_apply_backoff(),
            healthy_threshold: HealthStatus::default(),
            incident_log: default_incident_log(),
            scenarios: Vec::new(),
        }
    }
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("chaos.poll_interval_ms must be greater than zero"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(anyhow!(
                "chaos.recovery_timeout_secs must be greater than zero"
            ));
        }
        if self.apply_attempts == 0 {
            return Err(anyhow!("chaos.apply_attempts must be at least 1"));
        }
        for scenario in &self.scenarios {
            scenario.validate()?;
        }
        Ok(())
    }
}

/// Declarative scenario definition as written in the configuration file.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioConfig {
    pub id: String,
    pub category: ScenarioCategory,
    pub target: String,
    #[serde(default)]
    pub effect: EffectConfig,
    #[serde(default)]
    pub rollback: RollbackAction,
    /// Periodic trigger interval; scenarios without one are on-demand only.
    #[serde(rename = "interval_secs", default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub interval: Option<Duration>,
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("scenario id must not be empty"));
        }
        if self.target.trim().is_empty() {
            return Err(anyhow!("scenario '{}' must declare a target", self.id));
        }
        if self.rollback == RollbackAction::RevertAfterDuration && self.effect.duration.is_none()
        {
            return Err(anyhow!(
                "scenario '{}' uses revert-after-duration but declares no effect.duration_secs",
                self.id
            ));
        }
        if matches!(self.interval, Some(interval) if interval.is_zero()) {
            return Err(anyhow!(
                "scenario '{}' interval_secs must be greater than zero",
                self.id
            ));
        }
        Ok(())
    }
}

/// Effect parameters handed to the control surface.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EffectConfig {
    #[serde(rename = "duration_secs", default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub severity: Severity,
    /// Free-form settings forwarded to the control surface (command overrides, limits).
    #[serde(default)]
    pub settings: IndexMap<String, String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ScenarioCategory {
    NodeFailure,
    ResourceExhaustion,
    SecurityIncident,
    NetworkPartition,
}

impl ScenarioCategory {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// How an injection's effect is reverted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackAction {
    /// Revert through the control surface when the injection resolves.
    #[default]
    Revert,
    /// The scenario reverts itself once `effect.duration` elapses.
    RevertAfterDuration,
}

/// Cluster health colour. Ordered from worst to best so thresholds compare naturally.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Red,
    Yellow,
    #[default]
    Green,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}
