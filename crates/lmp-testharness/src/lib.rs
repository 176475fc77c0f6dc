//! ---
//! lmp_section: "11-simulation"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Scripted cluster double and fixtures for chaos engine tests."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! A [`ScriptedCluster`] answers health probes from a queue of scripted steps
//! and records every call made against it, so tests can assert how many
//! applies and reverts the engine issued.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lmp_chaos::{
    ChaosEngine, ClusterControl, ClusterError, ClusterHealthSnapshot, Effect, ScenarioRegistry,
};
use lmp_common::config::{
    ChaosConfig, EffectConfig, HealthStatus, RollbackAction, ScenarioCategory, ScenarioConfig,
};
use parking_lot::Mutex;
use tracing::trace;

/// One scripted answer to a health probe.
#[derive(Debug, Clone)]
pub enum HealthStep {
    /// Answer with this snapshot.
    Snapshot(ClusterHealthSnapshot),
    /// Fail the probe.
    Fail(ClusterError),
    /// Never answer.
    Hang,
}

impl HealthStep {
    pub fn healthy() -> Self {
        HealthStep::Snapshot(ClusterHealthSnapshot::green())
    }

    /// Red cluster with `target` listed as unhealthy.
    pub fn unhealthy(target: &str) -> Self {
        HealthStep::Snapshot(
            ClusterHealthSnapshot::new(HealthStatus::Red).with_unhealthy([target]),
        )
    }

    /// Cluster below green while the target itself looks fine.
    pub fn degraded(status: HealthStatus) -> Self {
        HealthStep::Snapshot(ClusterHealthSnapshot::new(status))
    }

    pub fn unavailable() -> Self {
        HealthStep::Fail(ClusterError::Unavailable("connection refused".into()))
    }
}

/// Call recorded by the scripted cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Health(String),
    Overview,
    Apply { target: String, scenario: String },
    Revert(String),
}

#[derive(Debug)]
struct State {
    script: VecDeque<HealthStep>,
    fallback: HealthStep,
    overview: HealthStep,
    apply_failures: u32,
    revert_failures: u32,
    apply_delay: Option<Duration>,
    degrade_polls: usize,
    degraded: HashMap<String, usize>,
    calls: Vec<ClusterCall>,
}

/// Cluster double driven by a health script.
///
/// Once the script runs out every probe gets the fallback step, which
/// defaults to a green snapshot.
#[derive(Debug)]
pub struct ScriptedCluster {
    state: Mutex<State>,
}

impl Default for ScriptedCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                script: VecDeque::new(),
                fallback: HealthStep::healthy(),
                overview: HealthStep::healthy(),
                apply_failures: 0,
                revert_failures: 0,
                apply_delay: None,
                degrade_polls: 0,
                degraded: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }
}

impl ScriptedCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a step for the next unanswered probe.
    pub fn push(&self, step: HealthStep) -> &Self {
        self.state.lock().script.push_back(step);
        self
    }

    /// Queue `polls` probes that report `target` unhealthy.
    pub fn unhealthy_for(&self, target: &str, polls: usize) -> &Self {
        let mut state = self.state.lock();
        for _ in 0..polls {
            state.script.push_back(HealthStep::unhealthy(target));
        }
        drop(state);
        self
    }

    /// Answer used once the script is exhausted.
    pub fn fallback(&self, step: HealthStep) -> &Self {
        self.state.lock().fallback = step;
        self
    }

    /// Answer for whole-cluster overview requests.
    pub fn overview_step(&self, step: HealthStep) -> &Self {
        self.state.lock().overview = step;
        self
    }

    /// Reject the next `count` apply calls.
    pub fn fail_applies(&self, count: u32) -> &Self {
        self.state.lock().apply_failures = count;
        self
    }

    /// Reject the next `count` revert calls.
    pub fn fail_reverts(&self, count: u32) -> &Self {
        self.state.lock().revert_failures = count;
        self
    }

    /// Delay every apply call, widening race windows in concurrency tests.
    pub fn apply_delay(&self, delay: Duration) -> &Self {
        self.state.lock().apply_delay = Some(delay);
        self
    }

    /// After every successful apply, report the target unhealthy for the
    /// next `polls` health calls the script does not answer.
    pub fn degrade_on_apply(&self, polls: usize) -> &Self {
        self.state.lock().degrade_polls = polls;
        self
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().calls.clone()
    }

    pub fn apply_calls(&self) -> usize {
        self.count(|call| matches!(call, ClusterCall::Apply { .. }))
    }

    pub fn revert_calls(&self) -> usize {
        self.count(|call| matches!(call, ClusterCall::Revert(_)))
    }

    pub fn revert_calls_for(&self, target: &str) -> usize {
        self.count(|call| matches!(call, ClusterCall::Revert(t) if t == target))
    }

    pub fn health_calls(&self) -> usize {
        self.count(|call| matches!(call, ClusterCall::Health(_)))
    }

    fn count(&self, predicate: impl Fn(&ClusterCall) -> bool) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    async fn answer(step: HealthStep) -> Result<ClusterHealthSnapshot, ClusterError> {
        match step {
            HealthStep::Snapshot(mut snapshot) => {
                snapshot.observed_at = Utc::now();
                Ok(snapshot)
            }
            HealthStep::Fail(err) => Err(err),
            HealthStep::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ClusterControl for ScriptedCluster {
    async fn health(&self, target: &str) -> Result<ClusterHealthSnapshot, ClusterError> {
        let step = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.calls.push(ClusterCall::Health(target.to_string()));
            match state.script.pop_front() {
                Some(step) => step,
                None => match state.degraded.get_mut(target) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        HealthStep::unhealthy(target)
                    }
                    _ => state.fallback.clone(),
                },
            }
        };
        trace!(target_node = target, ?step, "scripted health probe");
        Self::answer(step).await
    }

    async fn overview(&self) -> Result<ClusterHealthSnapshot, ClusterError> {
        let step = {
            let mut state = self.state.lock();
            state.calls.push(ClusterCall::Overview);
            state.overview.clone()
        };
        Self::answer(step).await
    }

    async fn apply_effect(&self, target: &str, effect: &Effect) -> Result<(), ClusterError> {
        let (delay, fail) = {
            let mut state = self.state.lock();
            state.calls.push(ClusterCall::Apply {
                target: target.to_string(),
                scenario: effect.scenario_id.clone(),
            });
            let fail = state.apply_failures > 0;
            if fail {
                state.apply_failures -= 1;
            }
            (state.apply_delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ClusterError::Rejected(format!("{target} refused the effect")));
        }
        let mut state = self.state.lock();
        let polls = state.degrade_polls;
        if polls > 0 {
            state.degraded.insert(target.to_string(), polls);
        }
        Ok(())
    }

    async fn revert_effect(&self, target: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::Revert(target.to_string()));
        if state.revert_failures > 0 {
            state.revert_failures -= 1;
            return Err(ClusterError::Command(format!("revert on {target} failed")));
        }
        Ok(())
    }
}

/// On-demand node-failure scenario reverted through the control surface.
pub fn scenario(id: &str, target: &str) -> ScenarioConfig {
    ScenarioConfig {
        id: id.to_string(),
        category: ScenarioCategory::NodeFailure,
        target: target.to_string(),
        effect: EffectConfig::default(),
        rollback: RollbackAction::Revert,
        interval: None,
    }
}

/// Short intervals so paused-clock tests resolve quickly: 100 ms polls,
/// 2 s timeout, two probe retries, two apply attempts.
pub fn fast_config() -> ChaosConfig {
    ChaosConfig {
        poll_interval: Duration::from_millis(100),
        recovery_timeout: Duration::from_secs(2),
        health_retries: 2,
        apply_attempts: 2,
        apply_backoff: Duration::from_millis(10),
        healthy_threshold: HealthStatus::Green,
        incident_log: None,
        scenarios: Vec::new(),
    }
}

/// Engine over the scripted cluster with [`fast_config`] policy.
pub fn engine_with(cluster: &Arc<ScriptedCluster>, scenarios: &[ScenarioConfig]) -> Arc<ChaosEngine> {
    let registry = ScenarioRegistry::from_config(scenarios).unwrap_or_else(|err| {
        panic!("fixture scenarios must be valid: {err}");
    });
    let control: Arc<dyn ClusterControl> = cluster.clone();
    ChaosEngine::builder(registry, control)
        .config(&fast_config())
        .seed(7)
        .build()
}
