//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Cluster adapters backing the chaos engine capability set."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Control surface that applies and reverts effects by running shell commands.
//!
//! Commands come from the `[cluster.commands]` table keyed by scenario
//! category. A scenario may override either side through the
//! `apply_command` and `revert_command` effect settings.
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use indexmap::IndexMap;
use lmp_chaos::{ClusterError, Effect};
use lmp_common::config::{ClusterConfig, CommandTemplate};
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

const APPLY_OVERRIDE: &str = "apply_command";
const REVERT_OVERRIDE: &str = "revert_command";

/// Runs configured commands and remembers how to undo each applied effect.
#[derive(Debug)]
pub struct CommandControl {
    shell: String,
    commands: IndexMap<String, CommandTemplate>,
    timeout: Duration,
    active: Mutex<HashMap<String, String>>,
}

impl CommandControl {
    /// Control surface running `shell -c` with the given templates.
    pub fn new(
        shell: impl Into<String>,
        commands: IndexMap<String, CommandTemplate>,
        timeout: Duration,
    ) -> Self {
        Self {
            shell: shell.into(),
            commands,
            timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Control surface from the `[cluster]` section.
    pub fn from_config(config: &ClusterConfig) -> Self {
        // Effects such as restarts take longer than an HTTP probe.
        let timeout = config.request_timeout.max(Duration::from_secs(30));
        Self::new(config.shell.clone(), config.commands.clone(), timeout)
    }

    /// Targets with an applied, not yet reverted effect.
    pub fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<_> = self.active.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Run the apply command for `effect` against `target`.
    pub async fn apply(&self, target: &str, effect: &Effect) -> Result<(), ClusterError> {
        let template = self.commands.get(effect.category.as_str());
        let apply = effect
            .settings
            .get(APPLY_OVERRIDE)
            .or(template.map(|t| &t.apply))
            .ok_or_else(|| {
                ClusterError::Rejected(format!(
                    "no apply command configured for {}",
                    effect.category
                ))
            })?;
        let revert = effect
            .settings
            .get(REVERT_OVERRIDE)
            .or(template.map(|t| &t.revert))
            .ok_or_else(|| {
                ClusterError::Rejected(format!(
                    "no revert command configured for {}",
                    effect.category
                ))
            })?;

        let apply = render(apply, target, effect);
        let revert = render(revert, target, effect);
        self.run(&apply).await?;
        self.active.lock().insert(target.to_string(), revert);
        info!(
            target: "lmp::cluster::command",
            %target,
            scenario = %effect.scenario_id,
            "effect applied"
        );
        Ok(())
    }

    /// Run the remembered revert command for `target`. Nothing applied is a no-op.
    pub async fn revert(&self, target: &str) -> Result<(), ClusterError> {
        let Some(revert) = self.active.lock().get(target).cloned() else {
            debug!(target: "lmp::cluster::command", %target, "nothing to revert");
            return Ok(());
        };
        self.run(&revert).await?;
        self.active.lock().remove(target);
        info!(target: "lmp::cluster::command", %target, "effect reverted");
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<(), ClusterError> {
        debug!(target: "lmp::cluster::command", shell = %self.shell, %command, "running command");
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ClusterError::Unavailable(format!("failed to spawn {}: {err}", self.shell)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))?
            .map_err(|err| ClusterError::Command(err.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            target: "lmp::cluster::command",
            %command,
            status = %output.status,
            stderr = %stderr.trim(),
            "command failed"
        );
        Err(ClusterError::Command(format!(
            "`{command}` exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// Substitute `{target}`, `{scenario}`, `{category}`, `{severity}`,
/// `{duration_secs}` and every effect setting key.
fn render(template: &str, target: &str, effect: &Effect) -> String {
    let duration = effect
        .duration
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default();
    let mut rendered = template
        .replace("{target}", target)
        .replace("{scenario}", &effect.scenario_id)
        .replace("{category}", effect.category.as_str())
        .replace("{severity}", effect.severity.as_str())
        .replace("{duration_secs}", &duration);
    for (key, value) in &effect.settings {
        if key == APPLY_OVERRIDE || key == REVERT_OVERRIDE {
            continue;
        }
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}
