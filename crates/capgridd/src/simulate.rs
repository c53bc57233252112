//! Scheduling simulation over a [`ClusterConfig`].
//!
//! Each heartbeat runs one scheduling pass per worker in parallel (every
//! worker owns a disjoint share of the nodes but all workers touch every
//! attempt), an optional preemption pass, and finally pulls an allocation
//! snapshot from every attempt. Preempted containers are completed on the
//! following heartbeat pull, the way a node manager would report them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use capgrid_attempt::{
    Allocation, ApplicationAttemptState, AttemptContext, CompletionEvent, Container, ContainerStatus,
    NodeRegistry, QueueHeadroomProvider, QueueUsage, ResourceRequest, SchedulerNode,
    UsageReport,
};
use capgrid_core::{ANY, AttemptId, ContainerId, NodeId, NodeType, Resource};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::ClusterConfig;

/// Exit status reported for containers reclaimed by preemption.
const PREEMPTED_EXIT_STATUS: i32 = -102;

/// Outcome counters of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub allocated: u32,
    pub reserved: u32,
    pub unreserved: u32,
}

impl std::ops::AddAssign for PassStats {
    fn add_assign(&mut self, rhs: Self) {
        self.allocated += rhs.allocated;
        self.reserved += rhs.reserved;
        self.unreserved += rhs.unreserved;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRecord {
    pub heartbeat: u64,
    pub attempt: AttemptId,
    pub allocation: Allocation,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt: AttemptId,
    pub queue: String,
    pub live_containers: usize,
    pub reserved_containers: usize,
    pub pending: Resource,
    pub usage: UsageReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub cluster: Resource,
    pub passes: PassStats,
    pub preempted: u64,
    pub heartbeats: Vec<HeartbeatRecord>,
    pub attempts: Vec<AttemptSummary>,
}

pub struct Simulation {
    config: ClusterConfig,
    nodes: Arc<NodeRegistry>,
    queues: BTreeMap<String, Arc<QueueUsage>>,
    attempts: Vec<Arc<ApplicationAttemptState>>,
    next_container: AtomicU64,
}

impl Simulation {
    pub fn build(config: ClusterConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let nodes = Arc::new(NodeRegistry::new());
        for n in &config.nodes {
            nodes.add(SchedulerNode::new(
                NodeId::new(n.id.as_str()),
                &n.rack,
                &n.partition,
                Resource::new(n.memory_mb, n.vcores),
            ));
        }

        let queues: BTreeMap<String, Arc<QueueUsage>> = config
            .queues
            .iter()
            .map(|q| (q.name.clone(), Arc::new(QueueUsage::new(&q.name))))
            .collect();

        let cluster = nodes.cluster_resource();
        let mut attempts = Vec::with_capacity(config.attempts.len());
        for a in &config.attempts {
            let queue = queues
                .get(&a.queue)
                .with_context(|| format!("attempt {} refers to unknown queue {}", a.id, a.queue))?;
            let ctx = AttemptContext {
                queue: queue.clone(),
                node_lookup: nodes.clone(),
                config: config.scheduler.clone(),
            };
            let attempt = ApplicationAttemptState::new(AttemptId::new(a.id.as_str()), &a.user, a.am_request.as_ref(), ctx);
            attempt.update_resource_requests(a.requests.clone());

            let queue_config = config.queues.iter().find(|q| q.name == a.queue);
            match queue_config.and_then(|q| q.limit.map(|limit| (q, limit))) {
                Some((q, limit)) => attempt.set_headroom_provider(Arc::new(QueueHeadroomProvider::new(
                    queue.clone(),
                    &q.partition,
                    limit,
                ))),
                None => attempt.set_headroom(cluster),
            }
            attempts.push(Arc::new(attempt));
        }

        info!(
            nodes = nodes.len(),
            queues = queues.len(),
            attempts = attempts.len(),
            %cluster,
            "simulation built"
        );

        Ok(Self {
            config,
            nodes,
            queues,
            attempts,
            next_container: AtomicU64::new(1),
        })
    }

    pub fn attempts(&self) -> &[Arc<ApplicationAttemptState>] {
        &self.attempts
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<QueueUsage>> {
        self.queues.get(name)
    }

    fn container_id(&self, attempt: &AttemptId) -> ContainerId {
        let seq = self.next_container.fetch_add(1, Ordering::Relaxed);
        ContainerId::new(format!("container_{attempt}_{seq:06}"))
    }

    fn node_type(requests: &[ResourceRequest], node: &SchedulerNode) -> NodeType {
        let pending = |name: &str| {
            requests
                .iter()
                .any(|r| r.resource_name == name && r.num_containers > 0)
        };
        if pending(node.id().as_str()) {
            NodeType::NodeLocal
        } else if pending(node.rack()) {
            NodeType::RackLocal
        } else {
            NodeType::OffSwitch
        }
    }

    /// One scheduling pass of `worker` over its share of the nodes.
    ///
    /// Attempts are visited in an order rotated by `round` so no attempt
    /// always gets first pick.
    pub fn scheduling_pass(&self, worker: usize, round: u64) -> PassStats {
        let workers = self.config.simulation.workers.max(1);
        let mut stats = PassStats::default();
        if self.attempts.is_empty() {
            return stats;
        }

        for (idx, node) in self.nodes.nodes().into_iter().enumerate() {
            if idx % workers != worker {
                continue;
            }
            let offset = (round as usize + idx) % self.attempts.len();
            for i in 0..self.attempts.len() {
                let attempt = &self.attempts[(offset + i) % self.attempts.len()];
                stats += self.schedule_on_node(attempt, &node);
            }
        }
        debug!(worker, round, ?stats, "scheduling pass done");
        stats
    }

    fn schedule_on_node(&self, attempt: &ApplicationAttemptState, node: &SchedulerNode) -> PassStats {
        let mut stats = PassStats::default();
        if attempt.is_stopped() {
            return stats;
        }
        attempt.update_node_info_for_am_diagnostics(node);

        let partition = node.partition();
        for priority in attempt.priorities() {
            if attempt.total_required_resources(priority) == 0 {
                continue;
            }
            let requests = attempt.resource_requests(priority);
            let Some(any) = requests.iter().find(|r| r.resource_name == ANY) else {
                continue;
            };
            if any.node_label_expression != partition {
                continue;
            }
            let capability = any.capability;
            let existing = attempt.reserved_container(priority, node.id());

            if node.allocate_resource(capability) {
                if existing.is_some() && attempt.unreserve(priority, node) {
                    stats.unreserved += 1;
                }
                let container = Container {
                    id: self.container_id(attempt.id()),
                    node_id: node.id().clone(),
                    resource: capability,
                    priority,
                    is_am_container: false,
                    node_token: Some(format!("nmtoken:{}", node.id())),
                };
                let node_type = Self::node_type(&requests, node);
                match attempt.allocate(node_type, node, priority, any, container) {
                    Some(_) => stats.allocated += 1,
                    None => node.release_resource(capability),
                }
                continue;
            }

            // The node is full: hold it for this request unless another
            // attempt already does.
            if node.reservation().is_some_and(|r| &r.attempt_id != attempt.id()) {
                continue;
            }
            let container = Container {
                id: self.container_id(attempt.id()),
                node_id: node.id().clone(),
                resource: capability,
                priority,
                is_am_container: false,
                node_token: None,
            };
            match attempt.reserve(priority, node, existing, container) {
                Ok(_) => stats.reserved += 1,
                Err(e) => debug!(attempt = %attempt.id(), node = %node.id(), error = %e, "reservation lost"),
            }
        }
        stats
    }

    /// Mark one container of the largest consumer for every attempt that is
    /// starving: outstanding demand and nothing running.
    pub fn preemption_pass(&self) -> u64 {
        let mut marked = 0;
        let starving = self
            .attempts
            .iter()
            .filter(|a| a.num_live_containers() == 0 && !a.total_pending_requests().is_zero())
            .count();

        for _ in 0..starving {
            let victim = self
                .attempts
                .iter()
                .filter(|a| a.num_live_containers() > 1)
                .max_by_key(|a| (a.usage().total_used().memory_mb, a.id().clone()));
            let Some(victim) = victim else {
                break;
            };
            // Newest first; containers already marked refuse a second mark.
            let newly_marked = victim
                .live_containers()
                .into_iter()
                .rev()
                .any(|c| victim.mark_container_for_preemption(c.id()));
            if newly_marked {
                marked += 1;
            }
        }

        if marked > 0 {
            info!(starving, marked, "preemption pass");
        }
        marked
    }

    /// Pull a snapshot from every attempt and complete what it gave back.
    /// Empty snapshots are not recorded.
    pub fn heartbeat(&self, heartbeat: u64) -> (Vec<HeartbeatRecord>, u64) {
        let cluster = self.nodes.cluster_resource();
        let mut records = Vec::with_capacity(self.attempts.len());
        let mut preempted = 0;

        for attempt in &self.attempts {
            let allocation = attempt.get_allocation(cluster);
            for id in &allocation.preempted {
                if self.complete_preempted(attempt, id) {
                    preempted += 1;
                }
            }
            if allocation.is_empty() {
                continue;
            }
            records.push(HeartbeatRecord {
                heartbeat,
                attempt: attempt.id().clone(),
                allocation,
            });
        }
        (records, preempted)
    }

    fn complete_preempted(&self, attempt: &ApplicationAttemptState, id: &ContainerId) -> bool {
        let Some(rm) = attempt.live_containers().into_iter().find(|c| c.id() == id) else {
            warn!(attempt = %attempt.id(), container = %id, "preempted container already gone");
            return false;
        };
        let completed = attempt.container_completed(
            id,
            ContainerStatus::new(PREEMPTED_EXIT_STATUS, "Container preempted by scheduler"),
            CompletionEvent::Preempted,
            &rm.partition(),
        );
        if completed {
            match self.nodes.require(&rm.node_id()) {
                Ok(node) => node.release_resource(rm.allocated_resource()),
                Err(e) => warn!(attempt = %attempt.id(), container = %id, error = %e, "node resources not released"),
            }
        }
        completed
    }

    pub fn summary(&self) -> Vec<AttemptSummary> {
        self.attempts
            .iter()
            .map(|a| {
                let partition = a.am_partition();
                let partition_resource: Resource = self
                    .nodes
                    .nodes()
                    .iter()
                    .filter(|n| n.partition() == partition)
                    .map(|n| n.total_resource())
                    .sum();
                AttemptSummary {
                    attempt: a.id().clone(),
                    queue: a.queue_name().to_string(),
                    live_containers: a.num_live_containers(),
                    reserved_containers: a.num_reserved_containers(),
                    pending: a.total_pending_requests(),
                    usage: a.resource_usage_report(partition_resource, 1.0),
                }
            })
            .collect()
    }
}

/// Run the configured number of heartbeats.
pub async fn run(config: ClusterConfig) -> anyhow::Result<SimulationReport> {
    let sim = Arc::new(Simulation::build(config)?);
    let settings = sim.config.simulation.clone();
    let cluster = sim.nodes.cluster_resource();

    let mut ticker = tokio::time::interval(Duration::from_millis(settings.heartbeat_interval_ms.max(1)));
    let mut passes = PassStats::default();
    let mut preempted = 0;
    let mut heartbeats = Vec::new();

    for heartbeat in 1..=settings.heartbeats {
        ticker.tick().await;

        let mut handles = Vec::with_capacity(settings.workers);
        for worker in 0..settings.workers {
            let sim = sim.clone();
            handles.push(tokio::task::spawn_blocking(move || sim.scheduling_pass(worker, heartbeat)));
        }
        for handle in handles {
            passes += handle.await.context("scheduling worker panicked")?;
        }

        if settings.preempt_every > 0 && heartbeat % settings.preempt_every == 0 {
            let sim = sim.clone();
            tokio::task::spawn_blocking(move || sim.preemption_pass())
                .await
                .context("preemption pass panicked")?;
        }

        let (records, reclaimed) = sim.heartbeat(heartbeat);
        preempted += reclaimed;
        heartbeats.extend(records);
    }

    info!(
        heartbeats = settings.heartbeats,
        allocated = passes.allocated,
        reserved = passes.reserved,
        preempted,
        "simulation finished"
    );

    Ok(SimulationReport {
        cluster,
        passes,
        preempted,
        heartbeats,
        attempts: sim.summary(),
    })
}
