//! Cluster description loaded by `capgridd`.
//!
//! ```toml
//! [scheduler]
//! resource_calculator = "dominant"
//!
//! [simulation]
//! workers = 2
//! heartbeats = 10
//!
//! [[nodes]]
//! id = "n1"
//! memory_mb = 8192
//! vcores = 8
//!
//! [[queues]]
//! name = "root.default"
//!
//! [[attempts]]
//! id = "appattempt_1_0001"
//! user = "alice"
//! queue = "root.default"
//!
//! [[attempts.requests]]
//! priority = 1
//! resource_name = "*"
//! capability = { memory_mb = 1024, vcores = 1 }
//! num_containers = 4
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, bail};
use capgrid_attempt::ResourceRequest;
use capgrid_core::{NO_LABEL, Resource, SchedulerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub attempts: Vec<AttemptConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Scheduling passes run in parallel, each over its own share of nodes.
    pub workers: usize,
    pub heartbeats: u64,
    pub heartbeat_interval_ms: u64,
    /// Run a preemption pass every this many heartbeats; 0 disables it.
    pub preempt_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            heartbeats: 10,
            heartbeat_interval_ms: 100,
            preempt_every: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default = "default_rack")]
    pub rack: String,
    #[serde(default)]
    pub partition: String,
    pub memory_mb: u64,
    pub vcores: u32,
}

fn default_rack() -> String {
    "/default-rack".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Headroom limit handed to the queue's attempts. Without it attempts
    /// report the whole cluster as headroom.
    #[serde(default)]
    pub limit: Option<Resource>,
    #[serde(default)]
    pub partition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptConfig {
    pub id: String,
    pub user: String,
    pub queue: String,
    #[serde(default)]
    pub am_request: Option<ResourceRequest>,
    #[serde(default)]
    pub requests: Vec<ResourceRequest>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading cluster config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing cluster config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.minimum_allocation.is_zero() {
            bail!("scheduler.minimum_allocation must be non-zero");
        }
        if self.simulation.workers == 0 {
            bail!("simulation.workers must be at least 1");
        }
        if self.nodes.is_empty() {
            bail!("cluster has no nodes");
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                bail!("duplicate node id: {}", node.id);
            }
        }

        let queues: HashSet<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();
        if queues.len() != self.queues.len() {
            bail!("duplicate queue name");
        }

        let mut attempt_ids = HashSet::new();
        for attempt in &self.attempts {
            if !attempt_ids.insert(attempt.id.as_str()) {
                bail!("duplicate attempt id: {}", attempt.id);
            }
            if !queues.contains(attempt.queue.as_str()) {
                bail!("attempt {} refers to unknown queue {}", attempt.id, attempt.queue);
            }
        }
        Ok(())
    }

    pub fn cluster_resource(&self) -> Resource {
        self.nodes
            .iter()
            .map(|n| Resource::new(n.memory_mb, n.vcores))
            .sum()
    }

    /// Distinct partitions across all nodes, the default one included.
    pub fn partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self.nodes.iter().map(|n| n.partition.clone()).collect();
        partitions.push(NO_LABEL.to_string());
        partitions.sort();
        partitions.dedup();
        partitions
    }
}
