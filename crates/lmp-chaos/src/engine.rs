//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Wires registry, injector, monitor and incident log into one handle that
//! the scheduler and the operator API share.
use std::collections::HashMap;
use std::sync::Arc;

use lmp_common::config::ChaosConfig;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::busy::BusyTargets;
use crate::cluster::{ClusterControl, ClusterError, ClusterHealthSnapshot};
use crate::error::{ChaosError, Result};
use crate::incident_log::{IncidentFilter, IncidentLog, IncidentQuery};
use crate::injector::{Injection, Injector, InjectorPolicy};
use crate::metrics::ChaosMetrics;
use crate::monitor::{MonitorPolicy, RecoveryMonitor};
use crate::record::{InjectionId, InjectionRecord, TriggerSource};
use crate::scenario::{Scenario, ScenarioRegistry};

struct OpenInjection {
    abort: Option<oneshot::Sender<()>>,
    progress: watch::Receiver<InjectionRecord>,
}

/// Builder for [`ChaosEngine`].
pub struct ChaosEngineBuilder {
    registry: ScenarioRegistry,
    cluster: Arc<dyn ClusterControl>,
    injector_policy: InjectorPolicy,
    monitor_policy: MonitorPolicy,
    incidents: Option<Arc<IncidentLog>>,
    metrics: Option<ChaosMetrics>,
    seed: Option<u64>,
}

impl ChaosEngineBuilder {
    /// Builder with default policies, no incident file and no metrics.
    pub fn new(registry: ScenarioRegistry, cluster: Arc<dyn ClusterControl>) -> Self {
        Self {
            registry,
            cluster,
            injector_policy: InjectorPolicy::default(),
            monitor_policy: MonitorPolicy::default(),
            incidents: None,
            metrics: None,
            seed: None,
        }
    }

    /// Take retry and polling policy from the engine configuration.
    pub fn config(mut self, config: &ChaosConfig) -> Self {
        self.injector_policy = InjectorPolicy::from_config(config);
        self.monitor_policy = MonitorPolicy::from_config(config);
        self
    }

    /// Override the apply retry policy.
    pub fn injector_policy(mut self, policy: InjectorPolicy) -> Self {
        self.injector_policy = policy;
        self
    }

    /// Override the recovery polling policy.
    pub fn monitor_policy(mut self, policy: MonitorPolicy) -> Self {
        self.monitor_policy = policy;
        self
    }

    /// Use `incidents` instead of an in-memory log.
    pub fn incident_log(mut self, incidents: Arc<IncidentLog>) -> Self {
        self.incidents = Some(incidents);
        self
    }

    /// Record injections and outcomes into `metrics`.
    pub fn metrics(mut self, metrics: ChaosMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed the backoff jitter for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Finish the engine.
    pub fn build(self) -> Arc<ChaosEngine> {
        let mut injector = Injector::new(
            Arc::clone(&self.cluster),
            self.injector_policy,
            self.metrics.clone(),
        );
        if let Some(seed) = self.seed {
            injector = injector.with_seed(seed);
        }
        let monitor = RecoveryMonitor::new(
            Arc::clone(&self.cluster),
            self.monitor_policy,
            self.metrics.clone(),
        );
        Arc::new(ChaosEngine {
            registry: Arc::new(self.registry),
            cluster: self.cluster,
            injector,
            monitor,
            busy: BusyTargets::new(),
            open: Mutex::new(HashMap::new()),
            incidents: self
                .incidents
                .unwrap_or_else(|| Arc::new(IncidentLog::in_memory())),
            metrics: self.metrics,
        })
    }
}

/// Shared chaos engine handle.
///
/// Triggers run the injector on an admission task and hand the injection to
/// a spawned monitor task. The busy-target lock covers only the claim, never the
/// calls to the control surface.
pub struct ChaosEngine {
    registry: Arc<ScenarioRegistry>,
    cluster: Arc<dyn ClusterControl>,
    injector: Injector,
    monitor: RecoveryMonitor,
    busy: BusyTargets,
    open: Mutex<HashMap<InjectionId, OpenInjection>>,
    incidents: Arc<IncidentLog>,
    metrics: Option<ChaosMetrics>,
}

impl ChaosEngine {
    /// Start building an engine over `registry` and `cluster`.
    pub fn builder(registry: ScenarioRegistry, cluster: Arc<dyn ClusterControl>) -> ChaosEngineBuilder {
        ChaosEngineBuilder::new(registry, cluster)
    }

    /// Registered scenarios.
    pub fn registry(&self) -> &Arc<ScenarioRegistry> {
        &self.registry
    }

    /// Finalized incidents.
    pub fn incidents(&self) -> &Arc<IncidentLog> {
        &self.incidents
    }

    /// Polling policy applied to every injection.
    pub fn monitor_policy(&self) -> MonitorPolicy {
        self.monitor.policy()
    }

    /// Registered scenarios in registration order.
    pub fn scenarios(&self) -> Vec<Arc<Scenario>> {
        self.registry.list().cloned().collect()
    }

    /// Trigger a scenario.
    ///
    /// Returns once the effect took hold and monitoring started. Fails with
    /// [`ChaosError::TargetBusy`] when the target already has an open
    /// injection and [`ChaosError::InjectionFailed`] when the effect never
    /// took hold; neither leaves anything open.
    ///
    /// Admission runs on its own task. Dropping the returned future does not
    /// stop it, so an effect that takes hold is always monitored and rolled back.
    pub async fn trigger(self: &Arc<Self>, scenario_id: &str, source: TriggerSource) -> Result<InjectionId> {
        let scenario = self.registry.lookup(scenario_id)?;
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.admit(scenario, source).await })
            .await
            .map_err(|err| ChaosError::TaskFailed(err.to_string()))?
    }

    async fn admit(self: Arc<Self>, scenario: Arc<Scenario>, source: TriggerSource) -> Result<InjectionId> {
        let claim = match self.busy.try_claim(&scenario.target, &scenario.id) {
            Ok(claim) => claim,
            Err(err) => {
                warn!(
                    target: "lmp::chaos::engine",
                    scenario = %scenario.id,
                    target_node = %scenario.target,
                    trigger = %source,
                    error = %err,
                    "trigger rejected"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejection(&scenario.id, "target-busy");
                }
                return Err(err);
            }
        };

        // On failure the claim drops here and frees the target.
        let injection = self.injector.apply(Arc::clone(&scenario), source).await?;
        claim.keep();

        let id = injection.id();
        let (abort_tx, abort_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = watch::channel(injection.record().clone());
        let open = {
            let mut open = self.open.lock();
            open.insert(
                id,
                OpenInjection {
                    abort: Some(abort_tx),
                    progress: progress_rx,
                },
            );
            open.len()
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_open_injections(open);
        }

        tokio::spawn(Arc::clone(&self).resolve(injection, abort_rx, progress_tx));
        Ok(id)
    }

    /// Trigger a scenario on behalf of an operator.
    pub async fn trigger_now(self: &Arc<Self>, scenario_id: &str) -> Result<InjectionId> {
        self.trigger(scenario_id, TriggerSource::OnDemand).await
    }

    async fn resolve(
        self: Arc<Self>,
        mut injection: Injection,
        abort: oneshot::Receiver<()>,
        progress: watch::Sender<InjectionRecord>,
    ) {
        let record = self
            .monitor
            .track(&mut injection, &self.injector, abort, &progress)
            .await;
        drop(injection);

        if let Err(err) = self.incidents.append(record.clone()) {
            error!(
                target: "lmp::chaos::engine",
                injection = %record.id,
                scenario = %record.scenario_id,
                error = %err,
                "failed to append incident"
            );
        }
        self.busy.release(&record.target);
        let open = {
            let mut open = self.open.lock();
            open.remove(&record.id);
            open.len()
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(&record);
            metrics.set_open_injections(open);
        }
        progress.send_replace(record);
    }

    /// Request an abort. The monitor rolls back and closes the record as `aborted`.
    pub fn abort(&self, id: InjectionId) -> Result<()> {
        {
            let mut open = self.open.lock();
            if let Some(entry) = open.get_mut(&id) {
                match entry.abort.take() {
                    Some(abort) => {
                        let _ = abort.send(());
                        info!(target: "lmp::chaos::engine", injection = %id, "abort requested");
                    }
                    None => {
                        info!(target: "lmp::chaos::engine", injection = %id, "abort already pending");
                    }
                }
                return Ok(());
            }
        }
        if self.incidents.contains(id) {
            Err(ChaosError::AlreadyFinalized(id))
        } else {
            Err(ChaosError::IncidentNotFound(id))
        }
    }

    /// Current view of an injection, open or finalized.
    pub fn get(&self, id: InjectionId) -> Result<InjectionRecord> {
        let open = self
            .open
            .lock()
            .get(&id)
            .map(|entry| entry.progress.borrow().clone());
        open.or_else(|| self.incidents.get(id))
            .ok_or(ChaosError::IncidentNotFound(id))
    }

    /// Open injections ordered by start time.
    pub fn open_injections(&self) -> Vec<InjectionRecord> {
        let mut records: Vec<_> = self
            .open
            .lock()
            .values()
            .map(|entry| entry.progress.borrow().clone())
            .collect();
        records.sort_by_key(|record| record.started_at);
        records
    }

    /// Wait until an injection is finalized and return its record.
    pub async fn await_resolution(&self, id: InjectionId) -> Result<InjectionRecord> {
        let progress = self
            .open
            .lock()
            .get(&id)
            .map(|entry| entry.progress.clone());
        if let Some(mut progress) = progress {
            let resolved = progress
                .wait_for(InjectionRecord::is_finalized)
                .await
                .map(|record| record.clone());
            if let Ok(record) = resolved {
                return Ok(record);
            }
        }
        self.incidents
            .get(id)
            .ok_or(ChaosError::IncidentNotFound(id))
    }

    /// Finalized incidents matching the filter, ordered by start time.
    pub fn query(&self, filter: IncidentFilter) -> IncidentQuery {
        self.incidents.query(filter)
    }

    /// True while an open injection holds `target`.
    pub fn is_target_busy(&self, target: &str) -> bool {
        self.busy.is_busy(target)
    }

    /// Whole-cluster health as reported by the control surface.
    pub async fn cluster_health(&self) -> std::result::Result<ClusterHealthSnapshot, ClusterError> {
        self.cluster.overview().await
    }

    /// Abort every open injection and wait for each to roll back and finalize.
    pub async fn shutdown(&self) {
        let ids: Vec<_> = self.open.lock().keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!(
            target: "lmp::chaos::engine",
            open = ids.len(),
            "aborting open injections"
        );
        for id in &ids {
            let _ = self.abort(*id);
        }
        for id in ids {
            if let Err(err) = self.await_resolution(id).await {
                warn!(
                    target: "lmp::chaos::engine",
                    injection = %id,
                    error = %err,
                    "injection did not finalize during shutdown"
                );
            }
        }
    }
}

impl std::fmt::Debug for ChaosEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosEngine")
            .field("scenarios", &self.registry.len())
            .field("open", &self.open.lock().len())
            .field("incidents", &self.incidents.len())
            .finish_non_exhaustive()
    }
}
