//! The per-attempt aggregate.
//!
//! [`ApplicationAttemptState`] owns the live containers, reservations,
//! preemption marks and usage figures of one application attempt behind a
//! single mutex. Every public operation takes that lock for its whole
//! duration, so callers observe either all or none of an operation's effects.
//!
//! # Lock order
//!
//! ```text
//! attempt ──► node reservation slot   (one at a time)
//!         └─► queue metrics
//!         └─► container record        (leaf)
//! ```
//!
//! No method holds two attempt locks at once, including
//! [`transfer_state_from`](ApplicationAttemptState::transfer_state_from).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capgrid_core::{
    ANY, AttemptId, ContainerId, NO_LABEL, NodeId, NodeType, Priority, Resource, ResourceCalculator,
    SchedulerConfig,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocation::Allocation;
use crate::allocator::ContainerAllocator;
use crate::container::{CompletionEvent, Container, ContainerStatus, RmContainer};
use crate::diagnostics::{self, AmDiagnostics, AmState, QueueAmLimits, QueueCapacities};
use crate::error::{SchedulerError, SchedulerResult};
use crate::headroom::HeadroomProvider;
use crate::node::{NodeLookup, SchedulerNode};
use crate::preemption::PreemptionTracker;
use crate::queue::Queue;
use crate::requests::{AppSchedulingInfo, PendingRequestTracker, ResourceRequest};
use crate::reservation::ReservationManager;
use crate::usage::{AggregateUsage, Ledger, ResourceUsageTracker, UsageReport};

/// Collaborators handed to an attempt by its owning queue.
pub struct AttemptContext {
    pub queue: Arc<dyn Queue>,
    pub node_lookup: Arc<dyn NodeLookup>,
    pub config: SchedulerConfig,
}

struct AttemptInner {
    allocator: ContainerAllocator,
    reservations: ReservationManager,
    preemption: PreemptionTracker,
    usage: ResourceUsageTracker,
    aggregate: AggregateUsage,
    requests: Box<dyn PendingRequestTracker>,
    headroom_provider: Option<Arc<dyn HeadroomProvider>>,
    /// Limit pushed by the queue, used when no provider is set.
    headroom: Resource,
    last_headroom: Resource,
    am_partition: String,
    am_diagnostics: AmDiagnostics,
    am_allocated: bool,
    stopped: bool,
}

impl AttemptInner {
    fn headroom(&self) -> Resource {
        self.headroom_provider
            .as_ref()
            .map_or(self.headroom, |p| p.headroom())
    }
}

pub struct ApplicationAttemptState {
    id: AttemptId,
    user: String,
    queue: Arc<dyn Queue>,
    node_lookup: Arc<dyn NodeLookup>,
    calculator: Arc<dyn ResourceCalculator>,
    minimum_allocation: Resource,
    usage_refresh: Duration,
    am_resource: Resource,
    inner: Mutex<AttemptInner>,
}

impl ApplicationAttemptState {
    /// Create an attempt. The AM resource and partition come from
    /// `am_request`; without one the minimum allocation on the default
    /// partition is assumed.
    pub fn new(id: AttemptId, user: &str, am_request: Option<&ResourceRequest>, ctx: AttemptContext) -> Self {
        let (am_resource, am_partition) = match am_request {
            Some(r) => (r.capability, r.node_label_expression.clone()),
            None => (ctx.config.minimum_allocation, NO_LABEL.to_string()),
        };

        let mut usage = ResourceUsageTracker::new();
        usage.set_am_resource(&am_partition, am_resource);

        info!(
            attempt = %id,
            %user,
            queue = ctx.queue.name(),
            %am_resource,
            am_partition = %am_partition,
            "attempt created"
        );

        let inner = AttemptInner {
            allocator: ContainerAllocator::new(),
            reservations: ReservationManager::new(),
            preemption: PreemptionTracker::new(),
            usage,
            aggregate: AggregateUsage::new(Instant::now()),
            requests: Box::new(AppSchedulingInfo::new()),
            headroom_provider: None,
            headroom: Resource::zero(),
            last_headroom: Resource::zero(),
            am_partition,
            am_diagnostics: AmDiagnostics::new(),
            am_allocated: false,
            stopped: false,
        };

        Self {
            id,
            user: user.to_string(),
            calculator: ctx.config.calculator(),
            minimum_allocation: ctx.config.minimum_allocation,
            usage_refresh: Duration::from_secs(ctx.config.aggregate_usage_refresh_secs),
            queue: ctx.queue,
            node_lookup: ctx.node_lookup,
            am_resource,
            inner: Mutex::new(inner),
        }
    }

    /// Replace the pending-request tracker.
    pub fn with_request_tracker(mut self, tracker: Box<dyn PendingRequestTracker>) -> Self {
        self.inner.get_mut().requests = tracker;
        self
    }

    fn ledger<'a>(&'a self, usage: &'a mut ResourceUsageTracker) -> Ledger<'a> {
        Ledger {
            attempt_id: &self.id,
            user: &self.user,
            usage,
            queue: self.queue.as_ref(),
        }
    }

    pub fn id(&self) -> &AttemptId {
        &self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn am_resource(&self) -> Resource {
        self.am_resource
    }

    pub fn am_partition(&self) -> String {
        self.inner.lock().am_partition.clone()
    }

    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        info!(attempt = %self.id, "attempt stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn update_resource_requests(&self, requests: Vec<ResourceRequest>) {
        self.inner.lock().requests.update_resource_requests(requests);
    }

    pub fn resource_requests(&self, priority: Priority) -> Vec<ResourceRequest> {
        self.inner.lock().requests.resource_requests(priority)
    }

    /// Priorities with requests on record, ascending.
    pub fn priorities(&self) -> Vec<Priority> {
        self.inner.lock().requests.priorities()
    }

    pub fn total_required_resources(&self, priority: Priority) -> u32 {
        self.inner.lock().requests.total_required_resources(priority)
    }

    // --- allocation ------------------------------------------------------

    /// Record `container` as live on `node`.
    ///
    /// Returns `None` when the attempt is stopped, nothing is outstanding at
    /// `priority`, or the id is already live or reserved.
    pub fn allocate(
        &self,
        node_type: NodeType,
        node: &SchedulerNode,
        priority: Priority,
        request: &ResourceRequest,
        container: Container,
    ) -> Option<Arc<RmContainer>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.stopped {
            debug!(attempt = %self.id, "allocate on stopped attempt");
            return None;
        }
        if inner.requests.total_required_resources(priority) == 0 {
            debug!(attempt = %self.id, %priority, "no outstanding demand");
            return None;
        }
        if inner.allocator.is_live(&container.id) || inner.reservations.contains_container(&container.id) {
            warn!(
                attempt = %self.id,
                container = %container.id,
                "container id already live or reserved, not allocating"
            );
            return None;
        }

        inner.aggregate.accrue(Instant::now(), inner.usage.total_used());
        let mut ledger = self.ledger(&mut inner.usage);
        let rm = inner.allocator.allocate(
            &mut ledger,
            inner.requests.as_mut(),
            node_type,
            node,
            priority,
            request,
            container,
        );

        if rm.is_am_container() {
            inner.am_allocated = true;
            inner.am_diagnostics.update(AmState::Assigned, None);
        }
        Some(rm)
    }

    /// Retire a live container, releasing its usage from `partition`.
    ///
    /// Returns `false` if the id is not live; a repeated call is a no-op.
    pub fn container_completed(
        &self,
        id: &ContainerId,
        status: ContainerStatus,
        event: CompletionEvent,
        partition: &str,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.allocator.is_live(id) {
            return false;
        }

        inner.aggregate.accrue(Instant::now(), inner.usage.total_used());
        inner.preemption.unmark(id);
        let is_am = inner.allocator.get(id).is_some_and(|c| c.is_am_container());
        let exit_status = status.exit_status;
        let mut ledger = self.ledger(&mut inner.usage);
        let completed = inner
            .allocator
            .complete(&mut ledger, id, status, event, partition)
            .is_some();
        inner.aggregate.invalidate();
        if completed && is_am {
            inner.am_diagnostics.update(AmState::Completed, None);
        }

        info!(
            attempt = %self.id,
            container = %id,
            ?event,
            exit_status,
            "completed container"
        );
        completed
    }

    // --- reservations ----------------------------------------------------

    /// Reserve `node` at `priority`, or re-reserve when `existing` is the
    /// reservation already held there.
    pub fn reserve(
        &self,
        priority: Priority,
        node: &SchedulerNode,
        existing: Option<Arc<RmContainer>>,
        container: Container,
    ) -> SchedulerResult<Arc<RmContainer>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.allocator.is_live(&container.id) {
            return Err(SchedulerError::ContainerAlreadyLive(container.id));
        }

        let mut ledger = self.ledger(&mut inner.usage);
        let rm = inner
            .reservations
            .reserve(&mut ledger, priority, node, existing, container)?;
        Ok(rm)
    }

    pub fn unreserve(&self, priority: Priority, node: &SchedulerNode) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut ledger = self.ledger(&mut inner.usage);
        inner.reservations.unreserve(&mut ledger, priority, node)
    }

    /// Relocate a reservation of this attempt from `source` to `target`.
    pub fn move_reservation(&self, container: &Arc<RmContainer>, source: &SchedulerNode, target: &SchedulerNode) -> bool {
        let mut inner = self.inner.lock();
        inner
            .reservations
            .move_reservation(&self.id, container, source, target)
    }

    pub fn reserved_container(&self, priority: Priority, node_id: &NodeId) -> Option<Arc<RmContainer>> {
        self.inner.lock().reservations.get(priority, node_id).cloned()
    }

    pub fn re_reservations(&self, priority: Priority) -> u32 {
        self.inner.lock().reservations.re_reservations(priority)
    }

    /// First reservation at `priority`, in ascending node order, large
    /// enough to cover `need`.
    pub fn node_id_to_unreserve(&self, priority: Priority, need: Resource, cluster: Resource) -> Option<NodeId> {
        self.inner
            .lock()
            .reservations
            .node_id_to_unreserve(priority, need, self.calculator.as_ref(), cluster)
    }

    /// Pick a reservation to give up so that `need` can be placed elsewhere.
    ///
    /// The chosen reservation's resource is credited to the fallback headroom.
    pub fn find_node_to_unreserve(&self, priority: Priority, need: Resource, cluster: Resource) -> Option<Arc<RmContainer>> {
        let mut inner = self.inner.lock();
        let Some(node_id) = inner
            .reservations
            .node_id_to_unreserve(priority, need, self.calculator.as_ref(), cluster)
        else {
            debug!(attempt = %self.id, %priority, %need, "no reservation large enough to unreserve");
            return None;
        };

        if self.node_lookup.node(&node_id).is_none() {
            error!(attempt = %self.id, node = %node_id, "node to unreserve doesn't exist");
            return None;
        }

        let rm = inner.reservations.get(priority, &node_id)?.clone();
        inner.headroom += rm.reserved_resource();
        debug!(
            attempt = %self.id,
            node = %node_id,
            container = %rm.id(),
            "found reservation to unreserve"
        );
        Some(rm)
    }

    // --- preemption ------------------------------------------------------

    /// Mark a live container for reclamation. Unknown or completed ids are
    /// ignored.
    pub fn mark_container_for_preemption(&self, id: &ContainerId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.allocator.is_live(id) {
            debug!(attempt = %self.id, container = %id, "not live, ignoring preemption mark");
            return false;
        }
        let marked = inner.preemption.mark(id.clone());
        if marked {
            info!(
                attempt = %self.id,
                container = %id,
                pending = inner.preemption.len(),
                "container marked for preemption"
            );
        }
        marked
    }

    #[cfg(test)]
    fn preemption_marks(&self) -> std::collections::BTreeSet<ContainerId> {
        let inner = self.inner.lock();
        inner
            .allocator
            .live_containers()
            .into_iter()
            .map(|c| c.id().clone())
            .filter(|id| inner.preemption.is_marked(id))
            .collect()
    }

    // --- heartbeat -------------------------------------------------------

    /// Build the heartbeat snapshot, draining preemption marks and newly
    /// allocated containers.
    pub fn get_allocation(&self, cluster: Resource) -> Allocation {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let preempted = inner.preemption.drain();
        let preempted_total: Resource = preempted
            .iter()
            .filter_map(|id| inner.allocator.get(id))
            .map(|c| c.allocated_resource())
            .sum();
        let num_containers = self
            .calculator
            .divide(cluster, preempted_total, self.minimum_allocation)
            .ceil() as u32;
        let release = ResourceRequest::new(Priority::UNDEFINED, ANY, self.minimum_allocation, num_containers);

        let delivered = inner.allocator.drain_newly_allocated();
        let mut node_tokens = BTreeMap::new();
        for c in &delivered {
            if let Some(token) = &c.container().node_token {
                node_tokens.insert(c.container().node_id.clone(), token.clone());
            }
        }
        let containers: Vec<Container> = delivered.iter().map(|c| c.container().clone()).collect();
        if delivered.iter().any(|c| c.is_am_container()) {
            inner.am_diagnostics.update(AmState::Launched, None);
        }

        let headroom = inner.headroom();
        inner.last_headroom = headroom;

        debug!(
            attempt = %self.id,
            containers = containers.len(),
            preempted = preempted.len(),
            %preempted_total,
            %headroom,
            "allocation snapshot"
        );

        Allocation {
            containers,
            headroom,
            preempted,
            release_requests: vec![release],
            node_tokens,
        }
    }

    // --- partitions ------------------------------------------------------

    /// Move a live container's usage after its node was relabelled.
    pub fn node_partition_updated(&self, id: &ContainerId, old: &str, new: &str) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(rm) = inner.allocator.get(id).cloned() else {
            return false;
        };
        if old == new {
            return false;
        }
        // A repeated or stale relabel event must not move the usage twice.
        if rm.partition() != old {
            warn!(
                attempt = %self.id,
                container = %id,
                %old,
                recorded = %rm.partition(),
                "partition update does not match recorded partition, ignoring"
            );
            return false;
        }
        let resource = rm.allocated_resource();

        inner.usage.move_used(old, new, resource);
        self.queue.dec_used_resource(old, resource, &self.id);
        self.queue.inc_used_resource(new, resource, &self.id);

        if rm.is_am_container() {
            inner.usage.move_am_used(old, new, resource);
            self.queue.dec_am_used_resource(old, resource, &self.id);
            self.queue.inc_am_used_resource(new, resource, &self.id);
            inner.am_partition = new.to_string();
        }
        rm.set_partition(new);

        debug!(attempt = %self.id, container = %id, %old, %new, %resource, "container partition updated");
        true
    }

    // --- headroom --------------------------------------------------------

    pub fn set_headroom_provider(&self, provider: Arc<dyn HeadroomProvider>) {
        self.inner.lock().headroom_provider = Some(provider);
    }

    pub fn headroom_provider(&self) -> Option<Arc<dyn HeadroomProvider>> {
        self.inner.lock().headroom_provider.clone()
    }

    pub fn set_headroom(&self, headroom: Resource) {
        self.inner.lock().headroom = headroom;
    }

    pub fn headroom(&self) -> Resource {
        self.inner.lock().headroom()
    }

    /// Headroom reported by the last [`get_allocation`](Self::get_allocation).
    pub fn last_headroom(&self) -> Resource {
        self.inner.lock().last_headroom
    }

    /// Carry the previous attempt's headroom over to this one.
    pub fn transfer_state_from(&self, previous: &ApplicationAttemptState) {
        let (provider, headroom) = {
            let prev = previous.inner.lock();
            (prev.headroom_provider.clone(), prev.headroom)
        };
        let mut inner = self.inner.lock();
        inner.headroom_provider = provider;
        inner.headroom = headroom;
        debug!(attempt = %self.id, previous = %previous.id, "transferred state from previous attempt");
    }

    // --- reporting -------------------------------------------------------

    pub fn locality_wait_factor(&self, priority: Priority, cluster_nodes: usize) -> f64 {
        let requests = self.inner.lock().requests.resource_requests(priority).len();
        let required = requests.saturating_sub(1);
        (required as f64 / cluster_nodes.max(1) as f64).min(1.0)
    }

    /// Outstanding demand of all `*` requests.
    pub fn total_pending_requests(&self) -> Resource {
        self.inner
            .lock()
            .requests
            .all_resource_requests()
            .iter()
            .filter(|r| r.is_any_location())
            .map(|r| r.capability.multiply(r.num_containers))
            .sum()
    }

    pub fn total_pending_requests_per_partition(&self) -> BTreeMap<String, Resource> {
        let mut totals: BTreeMap<String, Resource> = BTreeMap::new();
        for r in self.inner.lock().requests.all_resource_requests() {
            if r.is_any_location() {
                *totals.entry(r.node_label_expression.clone()).or_default() +=
                    r.capability.multiply(r.num_containers);
            }
        }
        totals
    }

    pub fn resource_usage_report(&self, partition_resource: Resource, queue_absolute_capacity: f64) -> UsageReport {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let used = inner.usage.total_used();
        let reserved = inner.usage.total_reserved();
        let (memory_mb_seconds, vcore_seconds) =
            inner.aggregate.report(Instant::now(), self.usage_refresh, used);

        let queue_usage_percentage = if self.calculator.is_invalid_divisor(partition_resource) {
            0.0
        } else {
            self.calculator
                .divide(partition_resource, used, partition_resource.scale(queue_absolute_capacity))
                * 100.0
        };

        UsageReport {
            num_used_containers: inner.allocator.len(),
            num_reserved_containers: inner.reservations.len(),
            used,
            reserved,
            needed: used + reserved,
            memory_mb_seconds,
            vcore_seconds,
            queue_usage_percentage,
        }
    }

    // --- AM diagnostics --------------------------------------------------

    pub fn is_waiting_for_am_container(&self) -> bool {
        !self.inner.lock().am_allocated
    }

    pub fn am_state(&self) -> AmState {
        self.inner.lock().am_diagnostics.state()
    }

    pub fn am_diagnostics(&self) -> String {
        self.inner.lock().am_diagnostics.message().to_string()
    }

    pub fn update_app_skip_node_diagnostics(&self, message: &str) {
        self.inner.lock().am_diagnostics.set_skip_node(message);
    }

    pub fn update_node_info_for_am_diagnostics(&self, node: &SchedulerNode) {
        let mut inner = self.inner.lock();
        if !inner.am_allocated {
            inner.am_diagnostics.node_processed(node);
        }
    }

    pub fn pending_app_diagnostic_message(&self, limits: &QueueAmLimits) -> String {
        let partition = self.am_partition();
        diagnostics::pending_app_message(&partition, self.am_resource, limits)
    }

    pub fn activated_app_diagnostic_message(&self, capacities: &QueueCapacities) -> String {
        let partition = self.am_partition();
        diagnostics::activated_app_message(&partition, capacities)
    }

    // --- accessors -------------------------------------------------------

    pub fn live_containers(&self) -> Vec<Arc<RmContainer>> {
        self.inner.lock().allocator.live_containers()
    }

    pub fn live_containers_on(&self, node_id: &NodeId) -> Vec<Arc<RmContainer>> {
        self.inner.lock().allocator.live_on(node_id)
    }

    pub fn num_live_containers(&self) -> usize {
        self.inner.lock().allocator.len()
    }

    pub fn reserved_containers(&self) -> Vec<Arc<RmContainer>> {
        self.inner.lock().reservations.containers()
    }

    pub fn reserved_containers_at(&self, priority: Priority) -> Vec<(NodeId, Arc<RmContainer>)> {
        self.inner.lock().reservations.at_priority(priority)
    }

    pub fn reserved_priorities(&self) -> Vec<Priority> {
        self.inner.lock().reservations.priorities()
    }

    pub fn num_reserved_containers(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    /// Snapshot of the per-partition figures.
    pub fn usage(&self) -> ResourceUsageTracker {
        self.inner.lock().usage.clone()
    }
}
