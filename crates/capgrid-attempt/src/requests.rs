//! Outstanding resource requests of an application.
//!
//! The attempt consults a [`PendingRequestTracker`] before allocating and
//! asks it to consume the matching request afterwards. [`AppSchedulingInfo`]
//! is the in-process tracker keyed by `(priority, resource name)`.

use std::collections::BTreeMap;

use capgrid_core::{ANY, NO_LABEL, NodeType, Priority, Resource};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::container::Container;
use crate::node::SchedulerNode;

/// Ask for `num_containers` containers of `capability` at `resource_name`
/// (a node id, a rack name, or [`ANY`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub priority: Priority,
    pub resource_name: String,
    pub capability: Resource,
    pub num_containers: u32,
    #[serde(default = "default_relax_locality")]
    pub relax_locality: bool,
    #[serde(default)]
    pub node_label_expression: String,
}

fn default_relax_locality() -> bool {
    true
}

impl ResourceRequest {
    pub fn new(
        priority: Priority,
        resource_name: &str,
        capability: Resource,
        num_containers: u32,
    ) -> Self {
        Self {
            priority,
            resource_name: resource_name.to_string(),
            capability,
            num_containers,
            relax_locality: true,
            node_label_expression: NO_LABEL.to_string(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.node_label_expression = label.to_string();
        self
    }

    pub fn is_any_location(&self) -> bool {
        self.resource_name == ANY
    }

    /// Single-container copy, as recorded on the container it produced.
    fn single(&self) -> ResourceRequest {
        ResourceRequest {
            num_containers: 1,
            ..self.clone()
        }
    }
}

/// Bookkeeping of the requests an application still has outstanding.
pub trait PendingRequestTracker: Send {
    /// Outstanding container count at `priority` (the [`ANY`] request).
    fn total_required_resources(&self, priority: Priority) -> u32;

    /// Consume one container's worth of demand for an allocation of the
    /// given locality, returning single-container copies of every request
    /// that was decremented.
    fn allocate(
        &mut self,
        node_type: NodeType,
        node: &SchedulerNode,
        priority: Priority,
        request: &ResourceRequest,
        container: &Container,
    ) -> Vec<ResourceRequest>;

    /// Replace requests by `(priority, resource name)`.
    fn update_resource_requests(&mut self, requests: Vec<ResourceRequest>);

    fn resource_requests(&self, priority: Priority) -> Vec<ResourceRequest>;

    fn resource_request(&self, priority: Priority, resource_name: &str) -> Option<ResourceRequest>;

    fn all_resource_requests(&self) -> Vec<ResourceRequest>;

    fn priorities(&self) -> Vec<Priority>;
}

#[derive(Debug, Default)]
pub struct AppSchedulingInfo {
    requests: BTreeMap<Priority, BTreeMap<String, ResourceRequest>>,
}

impl AppSchedulingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrement one request; non-`ANY` requests vanish when exhausted.
    fn decrement(&mut self, priority: Priority, resource_name: &str) -> Option<ResourceRequest> {
        let at_priority = self.requests.get_mut(&priority)?;
        let request = at_priority.get_mut(resource_name)?;
        let consumed = request.single();
        request.num_containers = request.num_containers.saturating_sub(1);
        if request.num_containers == 0 && resource_name != ANY {
            at_priority.remove(resource_name);
        }
        Some(consumed)
    }
}

impl PendingRequestTracker for AppSchedulingInfo {
    fn total_required_resources(&self, priority: Priority) -> u32 {
        self.resource_request(priority, ANY)
            .map(|r| r.num_containers)
            .unwrap_or(0)
    }

    fn allocate(
        &mut self,
        node_type: NodeType,
        node: &SchedulerNode,
        priority: Priority,
        request: &ResourceRequest,
        container: &Container,
    ) -> Vec<ResourceRequest> {
        let names: Vec<&str> = match node_type {
            NodeType::NodeLocal => vec![node.id().as_str(), node.rack(), ANY],
            NodeType::RackLocal => vec![node.rack(), ANY],
            NodeType::OffSwitch => vec![ANY],
        };

        let consumed: Vec<ResourceRequest> = names
            .into_iter()
            .filter_map(|name| self.decrement(priority, name))
            .collect();

        debug!(
            container = %container.id,
            node = %node.id(),
            %priority,
            ?node_type,
            requested = %request.capability,
            consumed = consumed.len(),
            "consumed outstanding requests"
        );
        consumed
    }

    fn update_resource_requests(&mut self, requests: Vec<ResourceRequest>) {
        for request in requests {
            self.requests
                .entry(request.priority)
                .or_default()
                .insert(request.resource_name.clone(), request);
        }
    }

    fn resource_requests(&self, priority: Priority) -> Vec<ResourceRequest> {
        self.requests
            .get(&priority)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn resource_request(&self, priority: Priority, resource_name: &str) -> Option<ResourceRequest> {
        self.requests.get(&priority)?.get(resource_name).cloned()
    }

    fn all_resource_requests(&self) -> Vec<ResourceRequest> {
        self.requests
            .values()
            .flat_map(|m| m.values().cloned())
            .collect()
    }

    fn priorities(&self) -> Vec<Priority> {
        self.requests.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::descriptor;
    use capgrid_core::NodeId;

    fn info() -> AppSchedulingInfo {
        let mut info = AppSchedulingInfo::new();
        let cap = Resource::new(1024, 1);
        info.update_resource_requests(vec![
            ResourceRequest::new(Priority(1), "n1", cap, 1),
            ResourceRequest::new(Priority(1), "/rack1", cap, 2),
            ResourceRequest::new(Priority(1), ANY, cap, 3),
        ]);
        info
    }

    fn node() -> SchedulerNode {
        SchedulerNode::new(NodeId::new("n1"), "/rack1", "", Resource::new(8192, 8))
    }

    #[test]
    fn node_local_consumes_all_levels() {
        let mut info = info();
        let any = info.resource_request(Priority(1), ANY).unwrap();
        let consumed = info.allocate(
            NodeType::NodeLocal,
            &node(),
            Priority(1),
            &any,
            &descriptor("c1", "n1", 1024, 1),
        );

        assert_eq!(consumed.len(), 3);
        assert!(consumed.iter().all(|r| r.num_containers == 1));
        assert_eq!(info.total_required_resources(Priority(1)), 2);
        assert!(info.resource_request(Priority(1), "n1").is_none());
        assert_eq!(info.resource_request(Priority(1), "/rack1").unwrap().num_containers, 1);
    }

    #[test]
    fn off_switch_only_touches_any() {
        let mut info = info();
        let any = info.resource_request(Priority(1), ANY).unwrap();
        let consumed = info.allocate(
            NodeType::OffSwitch,
            &node(),
            Priority(1),
            &any,
            &descriptor("c1", "n1", 1024, 1),
        );
        assert_eq!(consumed.len(), 1);
        assert_eq!(info.total_required_resources(Priority(1)), 2);
        assert_eq!(info.resource_request(Priority(1), "/rack1").unwrap().num_containers, 2);
    }

    #[test]
    fn any_request_stays_at_zero() {
        let mut info = AppSchedulingInfo::new();
        info.update_resource_requests(vec![ResourceRequest::new(
            Priority(2),
            ANY,
            Resource::new(512, 1),
            1,
        )]);
        let any = info.resource_request(Priority(2), ANY).unwrap();
        info.allocate(NodeType::OffSwitch, &node(), Priority(2), &any, &descriptor("c1", "n1", 512, 2));

        assert_eq!(info.total_required_resources(Priority(2)), 0);
        assert_eq!(info.priorities(), vec![Priority(2)]);
        assert_eq!(info.total_required_resources(Priority(9)), 0);
    }
}
