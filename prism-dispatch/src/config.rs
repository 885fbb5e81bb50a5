//! Dispatch configuration

use crate::error::{DispatchError, Result};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main dispatch configuration for one search cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Identifier of the search cluster, used as the rotation key
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Hostname of this frontend, used to find a local corpus dispatch target
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Minimum active documents of a group, in percent of the median group,
    /// for the group to receive queries
    #[serde(default = "default_min_active_docs_percentage")]
    pub min_active_docs_percentage: f64,

    /// Interval between ping iterations in milliseconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Maximum time a topology update waits for new nodes to answer, in milliseconds
    #[serde(default = "default_topology_update_timeout")]
    pub topology_update_timeout_ms: u64,

    /// Minimum seconds between repeated reduced-coverage log lines
    #[serde(default = "default_coverage_log_interval")]
    pub coverage_log_interval_secs: u64,

    /// Groups of search nodes; the group id is the position in this list
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// One group of search nodes holding a full copy of the corpus
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// One search node
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Distribution key, unique within the cluster
    pub key: u32,
    /// Host the node runs on
    pub host: String,
}

fn default_cluster_id() -> String {
    "search".to_string()
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_min_active_docs_percentage() -> f64 {
    97.0
}

fn default_ping_interval() -> u64 {
    1000
}

fn default_topology_update_timeout() -> u64 {
    10_000
}

fn default_coverage_log_interval() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            hostname: default_hostname(),
            min_active_docs_percentage: default_min_active_docs_percentage(),
            ping_interval_ms: default_ping_interval(),
            topology_update_timeout_ms: default_topology_update_timeout(),
            coverage_log_interval_secs: default_coverage_log_interval(),
            groups: Vec::new(),
        }
    }
}

impl DispatchConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DispatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges, non-empty groups and key uniqueness
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.min_active_docs_percentage) {
            return Err(DispatchError::Config(format!(
                "min_active_docs_percentage must be within [0, 100], got {}",
                self.min_active_docs_percentage
            )));
        }
        if self.ping_interval_ms == 0 {
            return Err(DispatchError::Config(
                "ping_interval_ms must be positive".to_string(),
            ));
        }

        if let Some(position) = self.groups.iter().position(|g| g.nodes.is_empty()) {
            return Err(DispatchError::Config(format!("group {} has no nodes", position)));
        }

        let mut seen = HashSet::new();
        for node in self.groups.iter().flat_map(|g| g.nodes.iter()) {
            if !seen.insert(node.key) {
                return Err(DispatchError::Config(format!(
                    "distribution key {} is used by more than one node",
                    node.key
                )));
            }
        }
        Ok(())
    }

    /// Build fresh node objects for every configured node
    pub fn nodes(&self) -> Vec<Node> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(group_id, group)| {
                group
                    .nodes
                    .iter()
                    .map(move |n| Node::new(n.key, n.host.clone(), group_id as u32))
            })
            .collect()
    }

    /// Get ping interval as Duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Get topology update timeout as Duration
    pub fn topology_update_timeout(&self) -> Duration {
        Duration::from_millis(self.topology_update_timeout_ms)
    }

    /// Get coverage log interval as Duration
    pub fn coverage_log_interval(&self) -> Duration {
        Duration::from_secs(self.coverage_log_interval_secs)
    }
}
