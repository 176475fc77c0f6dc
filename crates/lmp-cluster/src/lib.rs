//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Cluster adapters backing the chaos engine capability set."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Adapters that connect the chaos engine to a real log cluster: an
//! Elasticsearch health probe and a shell-command control surface.
#![warn(missing_docs)]

pub mod command;
pub mod elasticsearch;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lmp_chaos::{ClusterControl, ClusterError, ClusterHealthSnapshot, Effect};
use lmp_common::config::ClusterConfig;

pub use command::CommandControl;
pub use elasticsearch::{ElasticsearchHealth, EsClusterHealth};

/// Health from Elasticsearch, effects through configured commands.
#[derive(Debug)]
pub struct LiveCluster {
    health: ElasticsearchHealth,
    control: CommandControl,
}

impl LiveCluster {
    /// Compose a live cluster from its two halves.
    pub fn new(health: ElasticsearchHealth, control: CommandControl) -> Self {
        Self { health, control }
    }

    /// Build both adapters from the `[cluster]` configuration section.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        Ok(Self::new(
            ElasticsearchHealth::from_config(config)?,
            CommandControl::from_config(config),
        ))
    }

    /// Share as the engine's capability set.
    pub fn into_control(self) -> Arc<dyn ClusterControl> {
        Arc::new(self)
    }
}

#[async_trait]
impl ClusterControl for LiveCluster {
    async fn health(&self, _target: &str) -> Result<ClusterHealthSnapshot, ClusterError> {
        // One probe covers every configured node; the monitor checks the target.
        self.health.snapshot().await
    }

    async fn overview(&self) -> Result<ClusterHealthSnapshot, ClusterError> {
        self.health.snapshot().await
    }

    async fn apply_effect(&self, target: &str, effect: &Effect) -> Result<(), ClusterError> {
        self.control.apply(target, effect).await
    }

    async fn revert_effect(&self, target: &str) -> Result<(), ClusterError> {
        self.control.revert(target).await
    }
}
