//! Heartbeat allocation snapshot.

use std::collections::{BTreeMap, BTreeSet};

use capgrid_core::{ContainerId, NodeId, Resource};
use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::requests::ResourceRequest;

/// Everything an attempt hands back on one heartbeat.
///
/// Built under the attempt lock, so the newly allocated containers, the
/// preemption set and the headroom all describe the same instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Containers allocated since the previous snapshot.
    pub containers: Vec<Container>,
    pub headroom: Resource,
    /// Live containers the scheduler wants back.
    pub preempted: BTreeSet<ContainerId>,
    /// Replacement demand for the preempted resources, sized in units of the
    /// minimum allocation. Always one request; its count is zero when
    /// nothing was preempted.
    pub release_requests: Vec<ResourceRequest>,
    /// Access tokens of the nodes hosting `containers`.
    pub node_tokens: BTreeMap<NodeId, String>,
}

impl Allocation {
    /// Nothing new for the application: no containers and no preemptions.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.preempted.is_empty()
    }
}
