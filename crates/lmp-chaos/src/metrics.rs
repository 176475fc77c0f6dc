//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::time::Duration;

use lmp_metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};

use crate::error::Result;
use crate::injector::RollbackOutcome;
use crate::record::{InjectionOutcome, InjectionRecord};

/// Metrics published by the chaos engine.
#[derive(Clone)]
pub struct ChaosMetrics {
    registry: SharedRegistry,
    injections_total: IntCounterVec,
    injection_failures_total: IntCounterVec,
    trigger_rejections_total: IntCounterVec,
    outcomes_total: IntCounterVec,
    recovery_seconds: HistogramVec,
    rollbacks_total: IntCounterVec,
    probe_errors_total: IntCounterVec,
    open_injections: IntGauge,
}

impl ChaosMetrics {
    /// Register the chaos metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let injections_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_injections_total",
                "Effects that took hold on a target",
            ),
            &["scenario", "category", "trigger"],
        )?;
        registry.register(Box::new(injections_total.clone()))?;

        let injection_failures_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_injection_failures_total",
                "Triggers whose effect never took hold after all apply attempts",
            ),
            &["scenario"],
        )?;
        registry.register(Box::new(injection_failures_total.clone()))?;

        let trigger_rejections_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_trigger_rejections_total",
                "Triggers rejected before any effect was applied",
            ),
            &["scenario", "reason"],
        )?;
        registry.register(Box::new(trigger_rejections_total.clone()))?;

        let outcomes_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_outcomes_total",
                "Finalized injections by outcome",
            ),
            &["scenario", "outcome"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "lmp_chaos_recovery_seconds",
            "Time from injection to observed cluster recovery",
        )
        .buckets(prometheus::exponential_buckets(0.5, 2.0, 12)?);
        let recovery_seconds = HistogramVec::new(histogram_opts, &["scenario"])?;
        registry.register(Box::new(recovery_seconds.clone()))?;

        let rollbacks_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_rollbacks_total",
                "Rollback requests by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let probe_errors_total = IntCounterVec::new(
            Opts::new(
                "lmp_chaos_health_probe_errors_total",
                "Health probes that failed or timed out while monitoring recovery",
            ),
            &["target"],
        )?;
        registry.register(Box::new(probe_errors_total.clone()))?;

        let open_injections = IntGauge::with_opts(Opts::new(
            "lmp_chaos_open_injections",
            "Injections currently awaiting resolution",
        ))?;
        registry.register(Box::new(open_injections.clone()))?;

        Ok(Self {
            registry,
            injections_total,
            injection_failures_total,
            trigger_rejections_total,
            outcomes_total,
            recovery_seconds,
            rollbacks_total,
            probe_errors_total,
            open_injections,
        })
    }

    /// Expose the underlying shared registry.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count an admitted injection.
    pub fn record_injection(&self, record: &InjectionRecord) {
        self.injections_total
            .with_label_values(&[
                record.scenario_id.as_str(),
                record.category.as_str(),
                record.trigger.as_str(),
            ])
            .inc();
    }

    /// Count a trigger whose effect never took hold.
    pub fn record_injection_failure(&self, scenario: &str) {
        self.injection_failures_total
            .with_label_values(&[scenario])
            .inc();
    }

    /// Count a trigger refused up front, e.g. because the target is busy.
    pub fn record_rejection(&self, scenario: &str, reason: &str) {
        self.trigger_rejections_total
            .with_label_values(&[scenario, reason])
            .inc();
    }

    /// Count a finalized record and observe its recovery time when present.
    pub fn record_outcome(&self, record: &InjectionRecord) {
        let outcome = record
            .outcome
            .map(|outcome| outcome.as_str())
            .unwrap_or("open");
        self.outcomes_total
            .with_label_values(&[record.scenario_id.as_str(), outcome])
            .inc();
        if let (Some(InjectionOutcome::Success), Some(recovery)) = (record.outcome, record.recovery)
        {
            self.observe_recovery(&record.scenario_id, recovery);
        }
    }

    fn observe_recovery(&self, scenario: &str, recovery: Duration) {
        self.recovery_seconds
            .with_label_values(&[scenario])
            .observe(recovery.as_secs_f64());
    }

    /// Count a rollback by result.
    pub fn record_rollback(&self, outcome: &RollbackOutcome) {
        self.rollbacks_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Count a failed or timed out health poll against `target`.
    pub fn inc_probe_error(&self, target: &str) {
        self.probe_errors_total.with_label_values(&[target]).inc();
    }

    /// Set the open injections gauge.
    pub fn set_open_injections(&self, open: usize) {
        self.open_injections.set(open as i64);
    }
}

impl std::fmt::Debug for ChaosMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosMetrics").finish_non_exhaustive()
    }
}
