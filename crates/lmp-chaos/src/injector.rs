//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Applies scenario effects through the control surface and reverts them
//! exactly once, whichever path asks first.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lmp_common::config::ChaosConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterControl, ClusterError};
use crate::error::{ChaosError, Result};
use crate::metrics::ChaosMetrics;
use crate::record::{InjectionId, InjectionRecord, TriggerSource};
use crate::scenario::Scenario;

/// Retry policy for applying and reverting effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectorPolicy {
    /// Attempts per apply or revert before giving up.
    pub attempts: u32,
    /// Base delay before the second attempt, doubled afterwards.
    pub backoff: Duration,
    /// Maximum jitter added to each delay.
    pub jitter: Duration,
}

impl InjectorPolicy {
    /// Policy with `attempts` apply calls spaced by `backoff` plus up to
    /// `jitter`.
    pub fn new(attempts: u32, backoff: Duration, jitter: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            jitter,
        }
    }

    /// Policy derived from the engine configuration; jitter is a quarter of the backoff.
    pub fn from_config(config: &ChaosConfig) -> Self {
        Self::new(
            config.apply_attempts,
            config.apply_backoff,
            config.apply_backoff / 4,
        )
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self.backoff.mul_f64(2u32.pow(exponent) as f64);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for InjectorPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_millis(60))
    }
}

/// Result of a rollback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// This call reverted the effect.
    Reverted,
    /// An earlier call already handled the rollback; nothing was done.
    AlreadyRolledBack,
    /// Every revert attempt failed. The injection still counts as rolled back
    /// so it is never retried from another path.
    RevertFailed,
}

impl RollbackOutcome {
    /// Stable label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackOutcome::Reverted => "reverted",
            RollbackOutcome::AlreadyRolledBack => "already-rolled-back",
            RollbackOutcome::RevertFailed => "revert-failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Pending,
    Reverting,
    Done { at: DateTime<Utc>, reverted: bool },
}

/// One-shot rollback latch shared by the monitor and the self-revert timer.
#[derive(Debug)]
struct RollbackLatch {
    state: watch::Sender<LatchState>,
}

impl RollbackLatch {
    fn new() -> Self {
        let (state, _) = watch::channel(LatchState::Pending);
        Self { state }
    }

    /// Move from pending to reverting. Only the first caller wins.
    fn begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LatchState::Pending {
                *state = LatchState::Reverting;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, reverted: bool) {
        self.state.send_replace(LatchState::Done {
            at: Utc::now(),
            reverted,
        });
    }

    async fn settled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, LatchState::Done { .. }))
            .await;
    }

    fn is_pending(&self) -> bool {
        *self.state.borrow() == LatchState::Pending
    }

    fn is_reverting(&self) -> bool {
        *self.state.borrow() == LatchState::Reverting
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        match *self.state.borrow() {
            LatchState::Done { at, .. } => Some(at),
            _ => None,
        }
    }
}

/// An effect that took hold, paired with its open record.
#[derive(Debug)]
pub struct Injection {
    record: InjectionRecord,
    scenario: Arc<Scenario>,
    started: Instant,
    latch: Arc<RollbackLatch>,
    timer: Option<JoinHandle<()>>,
}

impl Injection {
    /// Identifier of the injection.
    pub fn id(&self) -> InjectionId {
        self.record.id
    }

    /// Record as it stands.
    pub fn record(&self) -> &InjectionRecord {
        &self.record
    }

    /// Mutable record, updated by the monitor while polling.
    pub fn record_mut(&mut self) -> &mut InjectionRecord {
        &mut self.record
    }

    /// Scenario being injected.
    pub fn scenario(&self) -> &Arc<Scenario> {
        &self.scenario
    }

    /// Target the effect was applied to.
    pub fn target(&self) -> &str {
        &self.scenario.target
    }

    /// Monotonic instant at which the effect took hold.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// True once no rollback is pending.
    pub fn is_rolled_back(&self) -> bool {
        !self.latch.is_pending()
    }

    /// When the rollback completed, if it has.
    pub fn rolled_back_at(&self) -> Option<DateTime<Utc>> {
        self.latch.completed_at()
    }
}

impl Drop for Injection {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            // A revert already in flight is allowed to finish.
            if !self.latch.is_reverting() {
                timer.abort();
            }
        }
    }
}

#[derive(Clone)]
struct Reverter {
    cluster: Arc<dyn ClusterControl>,
    policy: InjectorPolicy,
    metrics: Option<ChaosMetrics>,
    rng: Arc<Mutex<StdRng>>,
}

impl Reverter {
    fn delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock();
        self.policy.backoff_delay(attempt, &mut rng)
    }

    async fn rollback(&self, latch: &RollbackLatch, id: InjectionId, target: &str) -> RollbackOutcome {
        if !latch.begin() {
            latch.settled().await;
            debug!(
                target: "lmp::chaos::injector",
                injection = %id,
                target_node = target,
                "rollback already handled"
            );
            let outcome = RollbackOutcome::AlreadyRolledBack;
            if let Some(metrics) = &self.metrics {
                metrics.record_rollback(&outcome);
            }
            return outcome;
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.cluster.revert_effect(target).await {
                Ok(()) => {
                    info!(
                        target: "lmp::chaos::injector",
                        injection = %id,
                        target_node = target,
                        attempt,
                        "effect reverted"
                    );
                    break RollbackOutcome::Reverted;
                }
                Err(err) => {
                    warn!(
                        target: "lmp::chaos::injector",
                        injection = %id,
                        target_node = target,
                        attempt,
                        error = %err,
                        "revert attempt failed"
                    );
                    if attempt >= self.policy.attempts {
                        error!(
                            target: "lmp::chaos::injector",
                            injection = %id,
                            target_node = target,
                            "exhausted revert attempts; effect may still be active"
                        );
                        break RollbackOutcome::RevertFailed;
                    }
                    sleep(self.delay(attempt)).await;
                }
            }
        };

        latch.finish(outcome == RollbackOutcome::Reverted);
        if let Some(metrics) = &self.metrics {
            metrics.record_rollback(&outcome);
        }
        outcome
    }
}

/// Applies and reverts scenario effects through the control surface.
pub struct Injector {
    reverter: Reverter,
}

impl Injector {
    /// Injector over `cluster`.
    pub fn new(
        cluster: Arc<dyn ClusterControl>,
        policy: InjectorPolicy,
        metrics: Option<ChaosMetrics>,
    ) -> Self {
        Self {
            reverter: Reverter {
                cluster,
                policy,
                metrics,
                rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0x1DEC_0DE5))),
            },
        }
    }

    /// Seed the jitter RNG for deterministic tests.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.reverter.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Retry policy in use.
    pub fn policy(&self) -> InjectorPolicy {
        self.reverter.policy
    }

    /// Apply the scenario's effect, retrying with backoff.
    ///
    /// On success the returned injection carries an open record whose start
    /// time is the moment the effect took hold. Scenarios that revert after a
    /// duration get a timer that rolls them back on their own.
    pub async fn apply(&self, scenario: Arc<Scenario>, trigger: TriggerSource) -> Result<Injection> {
        let effect = scenario.effect();
        let attempts = self.reverter.policy.attempts;
        let mut last_error: Option<ClusterError> = None;

        for attempt in 1..=attempts {
            debug!(
                target: "lmp::chaos::injector",
                scenario = %scenario.id,
                target_node = %scenario.target,
                attempt,
                "applying effect"
            );
            let applied = self
                .reverter
                .cluster
                .apply_effect(&scenario.target, &effect)
                .await;
            match applied {
                Ok(()) => return Ok(self.took_hold(scenario, trigger, attempt)),
                Err(err) => {
                    warn!(
                        target: "lmp::chaos::injector",
                        scenario = %scenario.id,
                        target_node = %scenario.target,
                        attempt,
                        error = %err,
                        "apply attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(self.reverter.delay(attempt)).await;
                    }
                }
            }
        }

        error!(
            target: "lmp::chaos::injector",
            scenario = %scenario.id,
            target_node = %scenario.target,
            attempts,
            "effect never took hold"
        );
        if let Some(metrics) = &self.reverter.metrics {
            metrics.record_injection_failure(&scenario.id);
        }
        Err(ChaosError::InjectionFailed {
            scenario: scenario.id.clone(),
            attempts,
            source: last_error
                .unwrap_or_else(|| ClusterError::Rejected("no apply attempt was made".into())),
        })
    }

    fn took_hold(&self, scenario: Arc<Scenario>, trigger: TriggerSource, attempt: u32) -> Injection {
        let record = InjectionRecord::open(&scenario, trigger);
        let started = Instant::now();
        let latch = Arc::new(RollbackLatch::new());

        info!(
            target: "lmp::chaos::injector",
            injection = %record.id,
            scenario = %scenario.id,
            category = %scenario.category,
            target_node = %scenario.target,
            trigger = %trigger,
            attempt,
            "effect took hold"
        );
        if let Some(metrics) = &self.reverter.metrics {
            metrics.record_injection(&record);
        }

        let timer = scenario.self_revert_after().map(|after| {
            let reverter = self.reverter.clone();
            let latch = Arc::clone(&latch);
            let target = scenario.target.clone();
            let id = record.id;
            tokio::spawn(async move {
                sleep(after).await;
                debug!(
                    target: "lmp::chaos::injector",
                    injection = %id,
                    target_node = %target,
                    "effect duration elapsed"
                );
                reverter.rollback(&latch, id, &target).await;
            })
        });

        Injection {
            record,
            scenario,
            started,
            latch,
            timer,
        }
    }

    /// Revert the injection's effect. Idempotent: only the first call
    /// reaches the control surface, later calls wait for it to settle.
    pub async fn rollback(&self, injection: &Injection) -> RollbackOutcome {
        self.reverter
            .rollback(&injection.latch, injection.id(), injection.target())
            .await
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("policy", &self.reverter.policy)
            .finish_non_exhaustive()
    }
}
