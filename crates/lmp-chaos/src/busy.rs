//! ---
//! lmp_section: "07-resilience-fault-tolerance"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Chaos engine: scenarios, injection, recovery tracking, incidents."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Per-target exclusion. At most one open injection may hold a target.
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ChaosError, Result};

/// Set of targets with an open injection, mapped to the owning scenario.
#[derive(Debug, Default)]
pub struct BusyTargets {
    inner: Mutex<HashMap<String, String>>,
}

impl BusyTargets {
    /// Empty set with no target claimed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim a target. The claim is released on drop unless kept.
    pub fn try_claim(&self, target: &str, scenario: &str) -> Result<TargetClaim<'_>> {
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.get(target) {
            return Err(ChaosError::TargetBusy {
                target: target.to_string(),
                scenario: owner.clone(),
            });
        }
        inner.insert(target.to_string(), scenario.to_string());
        debug!(target: "lmp::chaos::busy", target_node = target, scenario, "claimed target");
        Ok(TargetClaim {
            targets: self,
            target: target.to_string(),
            armed: true,
        })
    }

    /// Release a kept claim. Returns false when the target was not held.
    pub fn release(&self, target: &str) -> bool {
        let released = self.inner.lock().remove(target).is_some();
        if released {
            debug!(target: "lmp::chaos::busy", target_node = target, "released target");
        }
        released
    }

    /// True while an open injection holds `target`.
    pub fn is_busy(&self, target: &str) -> bool {
        self.inner.lock().contains_key(target)
    }

    /// Currently held targets, sorted.
    pub fn held(&self) -> Vec<String> {
        let mut targets: Vec<_> = self.inner.lock().keys().cloned().collect();
        targets.sort();
        targets
    }
}

/// Guard over a claimed target.
#[derive(Debug)]
#[must_use = "dropping the claim releases the target"]
pub struct TargetClaim<'a> {
    targets: &'a BusyTargets,
    target: String,
    armed: bool,
}

impl TargetClaim<'_> {
    /// Target this claim holds.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Keep the target held past this guard; it must later be released explicitly.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for TargetClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.targets.release(&self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_claim_on_same_target_is_rejected() {
        let busy = BusyTargets::new();
        let claim = busy.try_claim("es1", "node-down-es1").unwrap();
        let err = busy.try_claim("es1", "cpu-burn-es1").unwrap_err();
        assert!(
            matches!(err, ChaosError::TargetBusy { ref scenario, .. } if scenario == "node-down-es1")
        );
        assert!(busy.try_claim("es2", "node-down-es2").is_ok());
        drop(claim);
        assert!(!busy.is_busy("es1"));
    }

    #[test]
    fn kept_claim_survives_until_released() {
        let busy = BusyTargets::new();
        busy.try_claim("es1", "node-down-es1").unwrap().keep();
        assert_eq!(busy.held(), ["es1"]);
        assert!(busy.release("es1"));
        assert!(!busy.release("es1"));
    }

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        let busy = Arc::new(BusyTargets::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let busy = Arc::clone(&busy);
                std::thread::spawn(move || {
                    busy.try_claim("es1", &format!("scenario-{i}"))
                        .map(TargetClaim::keep)
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
