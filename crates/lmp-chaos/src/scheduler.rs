//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::ChaosEngine;
use crate::error::{ChaosError, Result};
use crate::record::{InjectionId, TriggerSource};
use crate::scenario::Scenario;

/// Fires periodic scenarios and forwards on-demand triggers to the engine.
#[derive(Debug)]
pub struct Scheduler;

impl Scheduler {
    /// Spawn one periodic loop per scenario that declares an interval.
    ///
    /// The first periodic trigger fires one interval after start. A tick that
    /// lands while the target is busy is skipped, not queued.
    pub fn start(engine: Arc<ChaosEngine>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = engine
            .registry()
            .periodic()
            .filter_map(|scenario| {
                let interval = scenario.interval?;
                Some(tokio::spawn(run_periodic(
                    Arc::clone(&engine),
                    Arc::clone(scenario),
                    interval,
                    shutdown_rx.clone(),
                )))
            })
            .collect::<Vec<_>>();
        info!(
            target: "lmp::chaos::scheduler",
            periodic = tasks.len(),
            scenarios = engine.registry().len(),
            "scheduler started"
        );
        SchedulerHandle {
            engine,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

async fn run_periodic(
    engine: Arc<ChaosEngine>,
    scenario: Arc<Scenario>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        match engine.trigger(&scenario.id, TriggerSource::Periodic).await {
            Ok(id) => debug!(
                target: "lmp::chaos::scheduler",
                scenario = %scenario.id,
                injection = %id,
                "periodic trigger fired"
            ),
            Err(ChaosError::TargetBusy { .. }) => debug!(
                target: "lmp::chaos::scheduler",
                scenario = %scenario.id,
                target_node = %scenario.target,
                "target busy; skipping periodic trigger"
            ),
            Err(err) => warn!(
                target: "lmp::chaos::scheduler",
                scenario = %scenario.id,
                error = %err,
                "periodic trigger failed"
            ),
        }
    }
    debug!(target: "lmp::chaos::scheduler", scenario = %scenario.id, "periodic loop stopped");
}

/// Handle over the running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    engine: Arc<ChaosEngine>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Engine the scheduler fires into.
    pub fn engine(&self) -> &Arc<ChaosEngine> {
        &self.engine
    }

    /// Number of periodic loops running.
    pub fn periodic_loops(&self) -> usize {
        self.tasks.len()
    }

    /// Operator trigger, bypassing the periodic clock.
    pub async fn trigger_now(&self, scenario_id: &str) -> Result<InjectionId> {
        self.engine.trigger_now(scenario_id).await
    }

    /// Stop periodic loops, then abort and finalize every open injection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(target: "lmp::chaos::scheduler", error = %err, "periodic loop panicked");
            }
        }
        self.engine.shutdown().await;
        info!(target: "lmp::chaos::scheduler", "scheduler stopped");
    }
}
