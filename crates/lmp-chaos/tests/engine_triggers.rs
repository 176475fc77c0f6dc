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

use lmp_chaos::incident_log::read_incident_file;
use lmp_chaos::{
    ChaosEngine, ChaosError, ChaosMetrics, ClusterControl, IncidentFilter, IncidentLog,
    InjectionOutcome, ScenarioCategory, ScenarioRegistry, TriggerSource,
};
use lmp_metrics::new_registry;
use lmp_testharness::{engine_with, fast_config, scenario, HealthStep, ScriptedCluster};

#[tokio::test(start_paused = true)]
async fn unknown_scenario_is_not_found() {
    let cluster = ScriptedCluster::new();
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);

    let err = engine.trigger_now("node-down-es9").await.unwrap_err();
    assert!(matches!(err, ChaosError::ScenarioNotFound(ref id) if id == "node-down-es9"));
    assert_eq!(cluster.apply_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_apply_leaves_nothing_open() {
    let cluster = ScriptedCluster::new();
    cluster.fail_applies(5);
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);

    let err = engine.trigger_now("node-down-es1").await.unwrap_err();
    assert!(matches!(err, ChaosError::InjectionFailed { attempts: 2, .. }));
    assert_eq!(cluster.apply_calls(), 2);
    assert_eq!(cluster.revert_calls(), 0);
    assert!(!engine.is_target_busy("es1"));
    assert!(engine.open_injections().is_empty());
    assert!(engine.incidents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_scenario_on_busy_target_is_rejected() {
    let cluster = ScriptedCluster::new();
    cluster.fallback(HealthStep::unhealthy("es1"));
    let mut cpu = scenario("cpu-burn-es1", "es1");
    cpu.category = ScenarioCategory::ResourceExhaustion;
    let engine = engine_with(
        &cluster,
        &[scenario("node-down-es1", "es1"), cpu, scenario("node-down-es2", "es2")],
    );

    let first = engine.trigger_now("node-down-es1").await.unwrap();
    let err = engine.trigger_now("cpu-burn-es1").await.unwrap_err();
    assert!(
        matches!(err, ChaosError::TargetBusy { ref target, ref scenario } if target == "es1" && scenario == "node-down-es1")
    );

    // Other targets are unaffected.
    let other = engine.trigger_now("node-down-es2").await.unwrap();
    assert_eq!(engine.open_injections().len(), 2);
    assert_eq!(cluster.apply_calls(), 2);

    engine.abort(first).unwrap();
    engine.abort(other).unwrap();
    engine.await_resolution(first).await.unwrap();
    engine.await_resolution(other).await.unwrap();

    // Target is free again once the first injection resolved.
    cluster.unhealthy_for("es1", 1).fallback(HealthStep::healthy());
    let retry = engine.trigger_now("cpu-burn-es1").await.unwrap();
    let record = engine.await_resolution(retry).await.unwrap();
    assert_eq!(record.outcome, Some(InjectionOutcome::Success));
    assert_eq!(record.category, ScenarioCategory::ResourceExhaustion);
}

#[tokio::test(start_paused = true)]
async fn dropped_trigger_still_monitors_and_reverts_the_effect() {
    let cluster = ScriptedCluster::new();
    cluster
        .apply_delay(Duration::from_millis(100))
        .degrade_on_apply(2);
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);

    // The caller gives up while the effect is still being applied.
    let dropped =
        tokio::time::timeout(Duration::from_millis(50), engine.trigger_now("node-down-es1")).await;
    assert!(dropped.is_err());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(cluster.apply_calls(), 1);
    assert_eq!(cluster.revert_calls_for("es1"), 1);
    assert!(!engine.is_target_busy("es1"));
    let records: Vec<_> = engine.query(IncidentFilter::new()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Some(InjectionOutcome::Success));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_admit_one_injection_per_target() {
    let cluster = ScriptedCluster::new();
    cluster
        .fallback(HealthStep::unhealthy("es1"))
        .apply_delay(Duration::from_millis(50));
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);

    let attempts = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.trigger_now("node-down-es1").await })
        })
        .collect::<Vec<_>>();

    let mut admitted = Vec::new();
    let mut busy = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(id) => admitted.push(id),
            Err(ChaosError::TargetBusy { .. }) => busy += 1,
            Err(other) => panic!("unexpected trigger error: {other}"),
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(busy, 7);
    assert_eq!(cluster.apply_calls(), 1);

    engine.shutdown().await;
    let record = engine.get(admitted[0]).unwrap();
    assert_eq!(record.outcome, Some(InjectionOutcome::Aborted));
    assert_eq!(cluster.revert_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn finalized_incidents_are_mirrored_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("incidents.jsonl");
    let cluster = ScriptedCluster::new();
    cluster.unhealthy_for("es1", 1);

    let registry = ScenarioRegistry::from_config(&[scenario("node-down-es1", "es1")]).unwrap();
    let control: Arc<dyn ClusterControl> = cluster.clone();
    let engine = ChaosEngine::builder(registry, control)
        .config(&fast_config())
        .incident_log(Arc::new(IncidentLog::open(&path).unwrap()))
        .build();

    let id = engine.trigger_now("node-down-es1").await.unwrap();
    engine.await_resolution(id).await.unwrap();

    let on_disk = read_incident_file(&path).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].id, id);
    assert_eq!(on_disk[0].trigger, TriggerSource::OnDemand);
    assert_eq!(on_disk[0].outcome, Some(InjectionOutcome::Success));

    let successes = engine
        .query(IncidentFilter::new().outcome(InjectionOutcome::Success))
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test(start_paused = true)]
async fn engine_metrics_track_injections_and_outcomes() {
    let registry = new_registry();
    let metrics = ChaosMetrics::new(registry.clone()).unwrap();
    let cluster = ScriptedCluster::new();
    cluster.fallback(HealthStep::unhealthy("es1"));

    let scenarios = ScenarioRegistry::from_config(&[scenario("node-down-es1", "es1")]).unwrap();
    let control: Arc<dyn ClusterControl> = cluster.clone();
    let engine = ChaosEngine::builder(scenarios, control)
        .config(&fast_config())
        .metrics(metrics)
        .build();

    let id = engine.trigger_now("node-down-es1").await.unwrap();
    let _ = engine.trigger_now("node-down-es1").await.unwrap_err();
    engine.await_resolution(id).await.unwrap();

    let families = registry.gather();
    let names: Vec<_> = families.iter().map(|family| family.get_name()).collect();
    for expected in [
        "lmp_chaos_injections_total",
        "lmp_chaos_trigger_rejections_total",
        "lmp_chaos_outcomes_total",
        "lmp_chaos_rollbacks_total",
        "lmp_chaos_open_injections",
    ] {
        assert!(names.contains(&expected), "missing metric family {expected}");
    }

    let outcomes = families
        .iter()
        .find(|family| family.get_name() == "lmp_chaos_outcomes_total")
        .unwrap();
    let failed = outcomes
        .get_metric()
        .iter()
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|label| label.get_name() == "outcome" && label.get_value() == "failed-to-recover")
        })
        .expect("failed-to-recover outcome recorded");
    assert_eq!(failed.get_counter().get_value() as u64, 1);
}

#[tokio::test(start_paused = true)]
async fn cluster_health_reports_the_overview() {
    let cluster = ScriptedCluster::new();
    cluster.overview_step(HealthStep::unavailable());
    let engine = engine_with(&cluster, &[]);

    assert!(engine.cluster_health().await.is_err());
    cluster.overview_step(HealthStep::healthy());
    assert_eq!(
        engine.cluster_health().await.unwrap().status,
        lmp_chaos::HealthStatus::Green
    );
    assert!(engine.scenarios().is_empty());
}
