//! Cluster liveness registry
//!
//! The sync pipeline consults a [`ClusterRegistry`] snapshot once per pass
//! to decide whether an ownership claim is still held by a live cluster.

use std::collections::HashMap;
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// What is known about a live cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterInfo {
    /// Human-readable cluster name
    pub name: String,
    /// When the cluster was last reported alive
    pub last_seen: SystemTime,
}

impl ClusterInfo {
    /// Info for a cluster seen just now
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_seen: SystemTime::now(),
        }
    }
}

/// Read-only view of which clusters are currently alive, keyed by cluster id
#[cfg_attr(test, automock)]
pub trait ClusterRegistry: Send + Sync {
    /// Snapshot of alive clusters
    fn alive_clusters(&self) -> HashMap<String, ClusterInfo>;
}

/// In-memory liveness set fed by whatever tracks cluster connections.
#[derive(Default)]
pub struct AliveClusters {
    clusters: DashMap<String, ClusterInfo>,
}

impl AliveClusters {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cluster as alive (or refresh it)
    pub fn mark_alive(&self, cluster_id: impl Into<String>, info: ClusterInfo) {
        let cluster_id = cluster_id.into();
        if self.clusters.insert(cluster_id.clone(), info).is_none() {
            info!(cluster_id = %cluster_id, "cluster became alive");
        }
    }

    /// Record a cluster as gone
    pub fn mark_gone(&self, cluster_id: &str) {
        if self.clusters.remove(cluster_id).is_some() {
            info!(cluster_id = %cluster_id, "cluster is gone");
        }
    }

    /// Whether a cluster is currently alive
    pub fn is_alive(&self, cluster_id: &str) -> bool {
        self.clusters.contains_key(cluster_id)
    }
}

impl ClusterRegistry for AliveClusters {
    fn alive_clusters(&self) -> HashMap<String, ClusterInfo> {
        self.clusters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
