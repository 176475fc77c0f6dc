//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Cluster adapters backing the chaos engine capability set."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
//! Elasticsearch health probe.
use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use lmp_chaos::{ClusterError, ClusterHealthSnapshot, HealthStatus};
use lmp_common::config::ClusterConfig;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Subset of the `_cluster/health` response the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsClusterHealth {
    /// Cluster name.
    #[serde(default)]
    pub cluster_name: String,
    /// Reported colour.
    pub status: HealthStatus,
    /// Nodes currently in the cluster.
    #[serde(default)]
    pub number_of_nodes: u32,
    /// Data nodes currently in the cluster.
    #[serde(default)]
    pub number_of_data_nodes: u32,
    /// Active primary shards.
    #[serde(default)]
    pub active_primary_shards: u32,
    /// Active shards.
    #[serde(default)]
    pub active_shards: u32,
    /// Shards not yet allocated.
    #[serde(default)]
    pub unassigned_shards: u32,
}

#[derive(Debug, Deserialize)]
struct CatNode {
    name: String,
}

/// Probe that reads cluster colour and node membership over HTTP.
#[derive(Debug, Clone)]
pub struct ElasticsearchHealth {
    client: Client,
    base: Url,
    nodes: Vec<String>,
    timeout: Duration,
}

impl ElasticsearchHealth {
    /// Probe against `host` expecting `nodes` to be present.
    pub fn new(host: &str, nodes: Vec<String>, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(host).with_context(|| format!("invalid elasticsearch host {host}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            base,
            nodes,
            timeout,
        })
    }

    /// Probe configured from the `[cluster]` section.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        Self::new(
            &config.elasticsearch_host,
            config.nodes.clone(),
            config.request_timeout,
        )
    }

    /// Raw `_cluster/health` response.
    pub async fn cluster_health(&self) -> Result<EsClusterHealth, ClusterError> {
        self.get_json("_cluster/health").await
    }

    /// Names of the nodes currently in the cluster.
    pub async fn present_nodes(&self) -> Result<BTreeSet<String>, ClusterError> {
        let nodes: Vec<CatNode> = self.get_json("_cat/nodes?format=json&h=name").await?;
        Ok(nodes.into_iter().map(|node| node.name).collect())
    }

    /// Snapshot combining cluster colour with configured nodes that are missing.
    pub async fn snapshot(&self) -> Result<ClusterHealthSnapshot, ClusterError> {
        let health = self.cluster_health().await?;
        let mut snapshot = ClusterHealthSnapshot::new(health.status);
        if !self.nodes.is_empty() {
            let present = self.present_nodes().await?;
            snapshot = snapshot.with_unhealthy(
                self.nodes
                    .iter()
                    .filter(|node| !present.contains(*node))
                    .cloned(),
            );
        }
        debug!(
            target: "lmp::cluster::elasticsearch",
            cluster = %health.cluster_name,
            status = %snapshot.status,
            unhealthy = snapshot.unhealthy_targets.len(),
            "cluster health probed"
        );
        Ok(snapshot)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let url = self
            .base
            .join(path)
            .map_err(|err| ClusterError::Http(format!("invalid path {path}: {err}")))?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClusterError::Http(format!("{url} returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ClusterError::Http(format!("failed to decode {url}: {err}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ClusterError {
        if err.is_timeout() {
            ClusterError::Timeout(self.timeout)
        } else if err.is_connect() {
            ClusterError::Unavailable(err.to_string())
        } else {
            ClusterError::Http(err.to_string())
        }
    }
}
