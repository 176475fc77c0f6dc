//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Polls cluster health after an injection until it recovers, times out or
//! is aborted, then rolls the effect back and closes the record.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lmp_common::config::{ChaosConfig, HealthStatus};
use tokio::sync::{oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::ClusterControl;
use crate::injector::{Injection, Injector, RollbackOutcome};
use crate::metrics::ChaosMetrics;
use crate::record::{InjectionOutcome, InjectionRecord};

/// Polling policy for recovery tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    /// Delay between health polls. Also bounds each individual probe.
    pub poll_interval: Duration,
    /// Time after injection start at which an unrecovered injection is closed.
    pub recovery_timeout: Duration,
    /// Consecutive probe failures tolerated; one more closes the injection.
    pub health_retries: u32,
    /// Minimum colour that counts as healthy.
    pub healthy_threshold: HealthStatus,
}

impl MonitorPolicy {
    /// Polling policy from the chaos configuration.
    pub fn from_config(config: &ChaosConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            recovery_timeout: config.recovery_timeout,
            health_retries: config.health_retries,
            healthy_threshold: config.healthy_threshold,
        }
    }

    /// Upper bound on how long an injection stays open before it is closed.
    pub fn max_open_duration(&self) -> Duration {
        self.recovery_timeout + self.poll_interval
    }
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            recovery_timeout: Duration::from_secs(120),
            health_retries: 3,
            healthy_threshold: HealthStatus::Green,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Recovered(Instant),
    TimedOut { target_recovered: Option<Instant> },
    ProbesExhausted,
    Aborted,
}

/// Tracks injections until they resolve.
pub struct RecoveryMonitor {
    cluster: Arc<dyn ClusterControl>,
    policy: MonitorPolicy,
    metrics: Option<ChaosMetrics>,
}

impl RecoveryMonitor {
    /// Monitor polling `cluster` with `policy`.
    pub fn new(
        cluster: Arc<dyn ClusterControl>,
        policy: MonitorPolicy,
        metrics: Option<ChaosMetrics>,
    ) -> Self {
        Self {
            cluster,
            policy,
            metrics,
        }
    }

    /// Polling policy in use.
    pub fn policy(&self) -> MonitorPolicy {
        self.policy
    }

    /// Track one injection to resolution and return its finalized record.
    ///
    /// The first poll happens immediately. A healthy answer counts as
    /// recovery only after some earlier poll showed the fault; an effect the
    /// cluster never notices runs into the timeout as `failed-to-recover`.
    /// Every resolution path, abort included, asks the injector to roll back before returning; the
    /// injector guarantees the control surface sees at most one revert.
    /// Intermediate progress is published on `progress`.
    pub async fn track(
        &self,
        injection: &mut Injection,
        injector: &Injector,
        mut abort: oneshot::Receiver<()>,
        progress: &watch::Sender<InjectionRecord>,
    ) -> InjectionRecord {
        let target = injection.target().to_string();
        let started = injection.started();
        let deadline = started + self.policy.recovery_timeout;
        let threshold = self.policy.healthy_threshold;

        let mut ticker = interval_at(started, self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;
        let mut target_faulted = false;
        let mut target_recovered: Option<Instant> = None;

        let resolution = loop {
            tokio::select! {
                biased;
                _ = &mut abort => break Resolution::Aborted,
                _ = ticker.tick() => {}
            }
            if Instant::now() >= deadline {
                break Resolution::TimedOut { target_recovered };
            }

            let probe = tokio::select! {
                biased;
                _ = &mut abort => break Resolution::Aborted,
                probe = timeout(self.policy.poll_interval, self.cluster.health(&target)) => probe,
            };

            let record = injection.record_mut();
            record.polls += 1;
            let poll = record.polls;
            match probe {
                Ok(Ok(snapshot)) => {
                    consecutive_errors = 0;
                    record.last_status = Some(snapshot.status);
                    let healthy = snapshot.is_healthy_for(&target, threshold);
                    if !healthy && !record.fault_observed {
                        record.fault_observed = true;
                        debug!(
                            target: "lmp::chaos::monitor",
                            injection = %record.id,
                            target_node = %target,
                            poll,
                            status = %snapshot.status,
                            "fault observed"
                        );
                    }
                    if healthy && record.fault_observed {
                        break Resolution::Recovered(Instant::now());
                    }
                    if !snapshot.target_healthy(&target) {
                        target_faulted = true;
                        target_recovered = None;
                    } else if target_faulted && target_recovered.is_none() {
                        target_recovered = Some(Instant::now());
                    }
                    debug!(
                        target: "lmp::chaos::monitor",
                        injection = %record.id,
                        target_node = %target,
                        poll,
                        status = %snapshot.status,
                        fault_observed = record.fault_observed,
                        target_recovered = target_recovered.is_some(),
                        "cluster not yet recovered"
                    );
                }
                Ok(Err(err)) => {
                    consecutive_errors += 1;
                    warn!(
                        target: "lmp::chaos::monitor",
                        injection = %record.id,
                        target_node = %target,
                        poll,
                        consecutive_errors,
                        error = %err,
                        "health probe failed"
                    );
                    self.probe_error(&target);
                }
                Err(_) => {
                    consecutive_errors += 1;
                    warn!(
                        target: "lmp::chaos::monitor",
                        injection = %record.id,
                        target_node = %target,
                        poll,
                        consecutive_errors,
                        "health probe timed out"
                    );
                    self.probe_error(&target);
                }
            }
            progress.send_replace(record.clone());

            if consecutive_errors > self.policy.health_retries {
                break Resolution::ProbesExhausted;
            }
        };

        let ended_at = Utc::now();
        let (outcome, recovery) = match resolution {
            Resolution::Recovered(at) => (InjectionOutcome::Success, Some(at - started)),
            Resolution::TimedOut {
                target_recovered: Some(at),
            } => (InjectionOutcome::Partial, Some(at - started)),
            Resolution::TimedOut {
                target_recovered: None,
            }
            | Resolution::ProbesExhausted => (InjectionOutcome::FailedToRecover, None),
            Resolution::Aborted => (InjectionOutcome::Aborted, None),
        };

        let rollback = injector.rollback(injection).await;
        let rolled_back_at = injection.rolled_back_at();

        let record = injection.record_mut();
        record.close(outcome, ended_at, recovery);
        record.rolled_back_at = rolled_back_at;

        if !record.fault_observed && matches!(resolution, Resolution::TimedOut { .. }) {
            warn!(
                target: "lmp::chaos::monitor",
                injection = %record.id,
                target_node = %target,
                polls = record.polls,
                "fault never became visible in cluster health"
            );
        }
        if outcome == InjectionOutcome::Success && rollback != RollbackOutcome::RevertFailed {
            info!(
                target: "lmp::chaos::monitor",
                injection = %record.id,
                scenario = %record.scenario_id,
                target_node = %target,
                polls = record.polls,
                recovery_ms = recovery.map(|d| d.as_millis() as u64),
                rollback = rollback.as_str(),
                "injection resolved"
            );
        } else {
            warn!(
                target: "lmp::chaos::monitor",
                injection = %record.id,
                scenario = %record.scenario_id,
                target_node = %target,
                outcome = %outcome,
                polls = record.polls,
                rollback = rollback.as_str(),
                "injection resolved without clean recovery"
            );
        }

        record.clone()
    }

    fn probe_error(&self, target: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_probe_error(target);
        }
    }
}

impl std::fmt::Debug for RecoveryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryMonitor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
