//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lmp_common::config::{HealthStatus, ScenarioCategory};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::scenario::Scenario;

/// Unique identifier of one injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InjectionId(Uuid);

impl InjectionId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InjectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InjectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InjectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What started an injection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TriggerSource {
    /// Fired by the scheduler on the scenario interval.
    Periodic,
    /// Fired by an operator or API call.
    OnDemand,
}

impl TriggerSource {
    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// How an injection resolved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InjectionOutcome {
    /// The cluster returned to healthy before the timeout.
    Success,
    /// The target recovered but the cluster stayed below the threshold.
    Partial,
    /// Recovery was not observed before the timeout or probes kept failing.
    FailedToRecover,
    /// An operator aborted the injection.
    Aborted,
}

impl InjectionOutcome {
    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// One injection from trigger to resolution.
///
/// Open while `outcome` is `None`. Finalized records are immutable and live
/// in the incident log.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionRecord {
    /// Incident identifier.
    pub id: InjectionId,
    /// Scenario that produced the injection.
    pub scenario_id: String,
    /// Category copied from the scenario.
    pub category: ScenarioCategory,
    /// Node or service the effect landed on.
    pub target: String,
    /// What fired the injection.
    pub trigger: TriggerSource,
    /// When the effect took hold.
    pub started_at: DateTime<Utc>,
    /// When the record was closed; `None` while open.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Resolution; `None` while open.
    #[serde(default)]
    pub outcome: Option<InjectionOutcome>,
    /// Time from injection to observed recovery: of the cluster on success,
    /// of the target alone on a partial outcome.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "recovery_ms", default)]
    pub recovery: Option<Duration>,
    /// Health polls issued while open.
    #[serde(default)]
    pub polls: u32,
    /// Last cluster colour the monitor observed.
    #[serde(default)]
    pub last_status: Option<HealthStatus>,
    /// True once a poll showed the fault. A healthy answer only counts as
    /// recovery after this is set.
    #[serde(default)]
    pub fault_observed: bool,
    /// When the effect was reverted.
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl InjectionRecord {
    /// Open record for a scenario whose effect just took hold.
    pub fn open(scenario: &Scenario, trigger: TriggerSource) -> Self {
        Self {
            id: InjectionId::new(),
            scenario_id: scenario.id.clone(),
            category: scenario.category,
            target: scenario.target.clone(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            recovery: None,
            polls: 0,
            last_status: None,
            fault_observed: false,
            rolled_back_at: None,
        }
    }

    /// True until the monitor closes the record.
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }

    /// True once outcome and end time are both set.
    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some() && self.ended_at.is_some()
    }

    /// Close the record with its outcome. Recovery is kept only for success and partial.
    pub fn close(
        &mut self,
        outcome: InjectionOutcome,
        ended_at: DateTime<Utc>,
        recovery: Option<Duration>,
    ) {
        self.outcome = Some(outcome);
        self.ended_at = Some(ended_at.max(self.started_at));
        self.recovery = match outcome {
            InjectionOutcome::Success | InjectionOutcome::Partial => recovery,
            _ => None,
        };
    }
}
