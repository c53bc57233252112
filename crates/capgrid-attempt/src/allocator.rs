//! Live containers of one attempt.
//!
//! Owns the live map and the queue of containers allocated since the last
//! heartbeat. Usage accounting for every insertion and removal goes through
//! the attempt's [`Ledger`], so `used[p]` always equals the sum of live
//! container resources in partition `p`.

use std::collections::HashMap;
use std::sync::Arc;

use capgrid_core::{ContainerId, NodeId, NodeType, Priority};
use tracing::debug;

use crate::container::{CompletionEvent, Container, ContainerEvent, ContainerStatus, RmContainer};
use crate::node::SchedulerNode;
use crate::requests::{PendingRequestTracker, ResourceRequest};
use crate::usage::Ledger;

#[derive(Debug, Default)]
pub struct ContainerAllocator {
    live: HashMap<ContainerId, Arc<RmContainer>>,
    newly_allocated: Vec<Arc<RmContainer>>,
}

impl ContainerAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ContainerId) -> Option<&Arc<RmContainer>> {
        self.live.get(id)
    }

    pub fn is_live(&self, id: &ContainerId) -> bool {
        self.live.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live containers, ordered by id.
    pub fn live_containers(&self) -> Vec<Arc<RmContainer>> {
        let mut containers: Vec<_> = self.live.values().cloned().collect();
        containers.sort_by(|a, b| a.id().cmp(b.id()));
        containers
    }

    pub fn live_on(&self, node_id: &NodeId) -> Vec<Arc<RmContainer>> {
        self.live_containers()
            .into_iter()
            .filter(|c| &c.node_id() == node_id)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn newly_allocated_len(&self) -> usize {
        self.newly_allocated.len()
    }

    /// Record `container` as live on `node` and consume the request it
    /// satisfies. Preconditions (not stopped, demand outstanding, id free)
    /// are checked by the caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn allocate(
        &mut self,
        ledger: &mut Ledger<'_>,
        tracker: &mut dyn PendingRequestTracker,
        node_type: NodeType,
        node: &SchedulerNode,
        priority: Priority,
        request: &ResourceRequest,
        container: Container,
    ) -> Arc<RmContainer> {
        let partition = node.partition();
        let resource = container.resource;
        let rm = Arc::new(RmContainer::new(
            container,
            ledger.attempt_id.clone(),
            ledger.user,
            &partition,
        ));

        self.live.insert(rm.id().clone(), rm.clone());
        self.newly_allocated.push(rm.clone());

        ledger.usage.inc_used(&partition, resource);
        ledger
            .queue
            .inc_used_resource(&partition, resource, ledger.attempt_id);
        if rm.is_am_container() {
            ledger.usage.inc_am_used(&partition, resource);
            ledger
                .queue
                .inc_am_used_resource(&partition, resource, ledger.attempt_id);
        }

        let consumed = tracker.allocate(node_type, node, priority, request, rm.container());
        rm.set_resource_requests(consumed);
        rm.handle(ContainerEvent::Start);

        debug!(
            attempt = %ledger.attempt_id,
            container = %rm.id(),
            node = %node.id(),
            %partition,
            %resource,
            ?node_type,
            live = self.live.len(),
            "allocated container"
        );
        rm
    }

    /// Remove a live container, releasing its usage from `partition`.
    ///
    /// Returns `None` if the id is not live.
    pub(crate) fn complete(
        &mut self,
        ledger: &mut Ledger<'_>,
        id: &ContainerId,
        status: ContainerStatus,
        event: CompletionEvent,
        partition: &str,
    ) -> Option<Arc<RmContainer>> {
        let rm = self.live.remove(id)?;
        self.newly_allocated.retain(|c| c.id() != id);

        rm.handle(ContainerEvent::Finished { status, event });

        let resource = rm.allocated_resource();
        ledger.queue.release_resources(ledger.user, 1, resource);
        ledger.usage.dec_used(partition, resource);
        ledger
            .queue
            .dec_used_resource(partition, resource, ledger.attempt_id);
        if rm.is_am_container() {
            ledger.usage.dec_am_used(partition, resource);
            ledger
                .queue
                .dec_am_used_resource(partition, resource, ledger.attempt_id);
        }

        debug!(
            attempt = %ledger.attempt_id,
            container = %id,
            ?event,
            %resource,
            %partition,
            "completed container"
        );
        Some(rm)
    }

    /// Hand over every container allocated since the last call, marking
    /// each acquired.
    pub(crate) fn drain_newly_allocated(&mut self) -> Vec<Arc<RmContainer>> {
        let drained = std::mem::take(&mut self.newly_allocated);
        for c in &drained {
            c.handle(ContainerEvent::Acquired);
        }
        drained
    }
}
