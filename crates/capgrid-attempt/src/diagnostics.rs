//! Application-master launch diagnostics.
//!
//! While an attempt waits for its AM container, each scheduling pass that
//! looks at it records which node was processed last and, when known, why
//! the node was skipped. Operators read the rendered text back through
//! [`AmDiagnostics::message`].

use std::fmt::Write as _;

use capgrid_core::Resource;
use serde::{Deserialize, Serialize};

use crate::node::SchedulerNode;

/// Shown in place of the empty default partition name.
pub const DEFAULT_PARTITION_DISPLAY: &str = "<DEFAULT_PARTITION>";

const LAST_NODE_PROCESSED: &str = " Last Node which was processed for the application : ";

/// Launch progress of the application master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmState {
    #[default]
    Inactivated,
    Activated,
    Assigned,
    Launched,
    Completed,
}

impl AmState {
    pub fn message(self) -> &'static str {
        match self {
            AmState::Inactivated => "AM container is not yet activated.",
            AmState::Activated => "Application is activated, waiting for resources to be assigned for AM.",
            AmState::Assigned => "Scheduler has assigned a container for AM, waiting for AM container to be launched",
            AmState::Launched => "AM container is launched, waiting for AM container to Register with RM",
            AmState::Completed => "AM container has completed.",
        }
    }
}

/// AM limits of the owning queue in the attempt's AM partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueAmLimits {
    pub am_resource_limit: Resource,
    pub user_am_resource_limit: Resource,
    pub am_used: Resource,
}

/// Capacities of the owning queue in the attempt's AM partition, as
/// fractions of the partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueCapacities {
    pub partition_resource: Resource,
    pub absolute_capacity: f64,
    pub absolute_used_capacity: f64,
    pub absolute_max_capacity: f64,
}

fn display_partition(partition: &str) -> &str {
    if partition.is_empty() {
        DEFAULT_PARTITION_DISPLAY
    } else {
        partition
    }
}

#[derive(Debug, Clone, Default)]
pub struct AmDiagnostics {
    state: AmState,
    message: String,
    skip_node: Option<String>,
}

impl AmDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AmState {
        self.state
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn update(&mut self, state: AmState, detail: Option<&str>) {
        self.state = state;
        self.message = format!("{}{}", state.message(), detail.unwrap_or_default());
    }

    /// Remember why the current node was skipped; consumed by the next
    /// [`node_processed`](Self::node_processed).
    pub fn set_skip_node(&mut self, message: &str) {
        self.skip_node = Some(message.to_string());
    }

    pub fn node_processed(&mut self, node: &SchedulerNode) {
        let mut detail = self.skip_node.take().unwrap_or_default();
        let _ = write!(
            detail,
            "{LAST_NODE_PROCESSED}{} ( Partition : [{}], Total resource : {}, Available resource : {} ).",
            node.id(),
            node.partition(),
            node.total_resource(),
            node.available_resource(),
        );
        self.update(AmState::Activated, Some(&detail));
    }
}

pub fn pending_app_message(am_partition: &str, am_resource: Resource, limits: &QueueAmLimits) -> String {
    format!(
        " Details : AM Partition = {}; AM Resource Request = {}; Queue Resource Limit for AM = {}; \
         User AM Resource Limit of the queue = {}; Queue AM Resource Usage = {}; ",
        display_partition(am_partition),
        am_resource,
        limits.am_resource_limit,
        limits.user_am_resource_limit,
        limits.am_used,
    )
}

pub fn activated_app_message(am_partition: &str, capacities: &QueueCapacities) -> String {
    format!(
        " Details : AM Partition = {} ; Partition Resource = {} ; Queue's Absolute capacity = {} % ; \
         Queue's Absolute used capacity = {} % ; Queue's Absolute max capacity = {} % ; ",
        display_partition(am_partition),
        capacities.partition_resource,
        capacities.absolute_capacity * 100.0,
        capacities.absolute_used_capacity * 100.0,
        capacities.absolute_max_capacity * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_core::NodeId;

    #[test]
    fn node_processed_consumes_skip_message() {
        let mut d = AmDiagnostics::new();
        let node = SchedulerNode::new(NodeId::new("n1"), "/rack1", "gpu", Resource::new(4096, 4));
        d.set_skip_node("node is full.");
        d.node_processed(&node);

        assert_eq!(d.state(), AmState::Activated);
        assert!(d.message().starts_with(AmState::Activated.message()));
        assert!(d.message().contains("node is full."));
        assert!(d.message().contains("n1 ( Partition : [gpu]"));

        d.node_processed(&node);
        assert!(!d.message().contains("node is full."));
    }

    #[test]
    fn pending_message_names_default_partition() {
        let msg = pending_app_message("", Resource::new(1024, 1), &QueueAmLimits::default());
        assert!(msg.contains("AM Partition = <DEFAULT_PARTITION>;"));
        assert!(msg.contains("AM Resource Request = <memory:1024, vCores:1>"));
    }

    #[test]
    fn activated_message_renders_percentages() {
        let caps = QueueCapacities {
            partition_resource: Resource::new(8192, 8),
            absolute_capacity: 0.5,
            absolute_used_capacity: 0.25,
            absolute_max_capacity: 1.0,
        };
        let msg = activated_app_message("x", &caps);
        assert!(msg.contains("AM Partition = x ;"));
        assert!(msg.contains("Queue's Absolute capacity = 50 %"));
        assert!(msg.contains("Queue's Absolute used capacity = 25 %"));
        assert!(msg.contains("Queue's Absolute max capacity = 100 %"));
    }
}
