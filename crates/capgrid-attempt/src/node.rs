//! Scheduler-side view of a cluster node.
//!
//! Each node carries exactly one reservation slot behind its own lock.
//! Lock order is attempt → node: a node lock is only ever taken by a thread
//! that already holds (or does not need) an attempt lock, and never while
//! another node lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use capgrid_core::{AttemptId, NodeId, Priority, Resource};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::container::RmContainer;
use crate::error::{NodeError, SchedulerError, SchedulerResult};

/// The reservation currently held in a node's slot.
#[derive(Debug, Clone)]
pub struct NodeReservation {
    pub attempt_id: AttemptId,
    pub priority: Priority,
    pub container: Arc<RmContainer>,
}

impl NodeReservation {
    pub fn holds(&self, container: &Arc<RmContainer>) -> bool {
        Arc::ptr_eq(&self.container, container)
    }
}

#[derive(Debug)]
pub struct SchedulerNode {
    id: NodeId,
    rack: String,
    partition: RwLock<String>,
    total: Resource,
    allocated: Mutex<Resource>,
    reservation: Mutex<Option<NodeReservation>>,
}

impl SchedulerNode {
    pub fn new(id: NodeId, rack: &str, partition: &str, total: Resource) -> Self {
        Self {
            id,
            rack: rack.to_string(),
            partition: RwLock::new(partition.to_string()),
            total,
            allocated: Mutex::new(Resource::zero()),
            reservation: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn rack(&self) -> &str {
        &self.rack
    }

    pub fn partition(&self) -> String {
        self.partition.read().clone()
    }

    /// Relabel the node, returning the previous partition.
    pub fn set_partition(&self, partition: &str) -> String {
        std::mem::replace(&mut *self.partition.write(), partition.to_string())
    }

    pub fn total_resource(&self) -> Resource {
        self.total
    }

    pub fn available_resource(&self) -> Resource {
        self.total - *self.allocated.lock()
    }

    /// Claim `resource` on the node if it fits in what is available.
    pub fn allocate_resource(&self, resource: Resource) -> bool {
        let mut allocated = self.allocated.lock();
        if !resource.fits_in(&(self.total - *allocated)) {
            return false;
        }
        *allocated += resource;
        true
    }

    pub fn release_resource(&self, resource: Resource) {
        let mut allocated = self.allocated.lock();
        *allocated -= resource;
    }

    pub fn reservation(&self) -> Option<NodeReservation> {
        self.reservation.lock().clone()
    }

    pub fn reserved_container(&self) -> Option<Arc<RmContainer>> {
        self.reservation.lock().as_ref().map(|r| r.container.clone())
    }

    /// Bind `container` into the slot.
    ///
    /// The slot may be overwritten by the attempt that already holds it; the
    /// displaced reservation, if any, is returned. A slot held by another
    /// attempt is left untouched.
    pub fn reserve_resource(
        &self,
        attempt_id: &AttemptId,
        priority: Priority,
        container: Arc<RmContainer>,
    ) -> Result<Option<NodeReservation>, NodeError> {
        let mut slot = self.reservation.lock();
        if let Some(current) = slot.as_ref() {
            if &current.attempt_id != attempt_id {
                return Err(NodeError::SlotOccupied {
                    node: self.id.clone(),
                    holder: current.attempt_id.clone(),
                });
            }
            debug!(node = %self.id, container = %container.id(), "updated reserved container");
        } else {
            debug!(node = %self.id, container = %container.id(), "reserved container");
        }
        Ok(slot.replace(NodeReservation {
            attempt_id: attempt_id.clone(),
            priority,
            container,
        }))
    }

    /// Bind `container` only if the slot is empty.
    pub fn reserve_if_vacant(
        &self,
        attempt_id: &AttemptId,
        priority: Priority,
        container: Arc<RmContainer>,
    ) -> Result<(), NodeError> {
        let mut slot = self.reservation.lock();
        if let Some(current) = slot.as_ref() {
            return Err(NodeError::SlotOccupied {
                node: self.id.clone(),
                holder: current.attempt_id.clone(),
            });
        }
        *slot = Some(NodeReservation {
            attempt_id: attempt_id.clone(),
            priority,
            container,
        });
        Ok(())
    }

    /// Clear the slot if it still holds exactly `container`.
    pub fn unreserve_if_holds(&self, container: &Arc<RmContainer>) -> bool {
        let mut slot = self.reservation.lock();
        match slot.as_ref() {
            Some(current) if current.holds(container) => {
                *slot = None;
                true
            }
            Some(current) => {
                warn!(
                    node = %self.id,
                    holder = %current.container.id(),
                    expected = %container.id(),
                    "reservation slot holds a different container"
                );
                false
            }
            None => false,
        }
    }

    pub fn is_reserved_by(&self, container: &Arc<RmContainer>) -> bool {
        self.reservation
            .lock()
            .as_ref()
            .is_some_and(|r| r.holds(container))
    }
}

/// Resolves node identities to live node handles.
pub trait NodeLookup: Send + Sync {
    fn node(&self, id: &NodeId) -> Option<Arc<SchedulerNode>>;
}

/// In-process node table.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<SchedulerNode>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: SchedulerNode) -> Arc<SchedulerNode> {
        let node = Arc::new(node);
        self.nodes.write().insert(node.id().clone(), node.clone());
        node
    }

    pub fn remove(&self, id: &NodeId) -> Option<Arc<SchedulerNode>> {
        self.nodes.write().remove(id)
    }

    pub fn require(&self, id: &NodeId) -> SchedulerResult<Arc<SchedulerNode>> {
        self.node(id)
            .ok_or_else(|| SchedulerError::NodeNotFound(id.clone()))
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<SchedulerNode>> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Sum of all node capacities.
    pub fn cluster_resource(&self) -> Resource {
        self.nodes.read().values().map(|n| n.total_resource()).sum()
    }
}

impl NodeLookup for NodeRegistry {
    fn node(&self, id: &NodeId) -> Option<Arc<SchedulerNode>> {
        self.nodes.read().get(id).cloned()
    }
}
