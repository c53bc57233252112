//! Node reservations held by one attempt.
//!
//! Reservations are indexed `priority → node → container`. Node maps are
//! `BTreeMap`s so scans over one priority visit nodes in ascending id order,
//! and a priority key is dropped as soon as its node map empties.
//!
//! Every method runs under the owning attempt's lock. Node slot locks are
//! taken one at a time, after the attempt lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use capgrid_core::{AttemptId, ContainerId, NodeId, Priority, Resource, ResourceCalculator};
use tracing::{debug, info, warn};

use crate::container::{Container, ContainerEvent, RmContainer};
use crate::error::NodeError;
use crate::node::SchedulerNode;
use crate::usage::Ledger;

#[derive(Debug, Default)]
pub struct ReservationManager {
    reserved: BTreeMap<Priority, BTreeMap<NodeId, Arc<RmContainer>>>,
    re_reservations: HashMap<Priority, u32>,
}

impl ReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, priority: Priority, node_id: &NodeId) -> Option<&Arc<RmContainer>> {
        self.reserved.get(&priority)?.get(node_id)
    }

    fn holds(&self, priority: Priority, node_id: &NodeId, container: &Arc<RmContainer>) -> bool {
        self.get(priority, node_id)
            .is_some_and(|c| Arc::ptr_eq(c, container))
    }

    pub fn contains_container(&self, id: &ContainerId) -> bool {
        self.reserved
            .values()
            .flat_map(|m| m.values())
            .any(|c| c.id() == id)
    }

    /// Reservations at `priority`, in ascending node order.
    pub fn at_priority(&self, priority: Priority) -> Vec<(NodeId, Arc<RmContainer>)> {
        self.reserved
            .get(&priority)
            .map(|m| m.iter().map(|(n, c)| (n.clone(), c.clone())).collect())
            .unwrap_or_default()
    }

    pub fn priorities(&self) -> Vec<Priority> {
        self.reserved.keys().copied().collect()
    }

    pub fn containers(&self) -> Vec<Arc<RmContainer>> {
        self.reserved
            .values()
            .flat_map(|m| m.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reserved.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    pub fn re_reservations(&self, priority: Priority) -> u32 {
        self.re_reservations.get(&priority).copied().unwrap_or(0)
    }

    fn add_re_reservation(&mut self, priority: Priority) {
        *self.re_reservations.entry(priority).or_insert(0) += 1;
    }

    fn reset_re_reservations(&mut self, priority: Priority) {
        self.re_reservations.remove(&priority);
    }

    /// Remove an index entry, dropping the priority key if it empties.
    fn remove(&mut self, priority: Priority, node_id: &NodeId) -> Option<Arc<RmContainer>> {
        let at_priority = self.reserved.get_mut(&priority)?;
        let removed = at_priority.remove(node_id);
        if at_priority.is_empty() {
            self.reserved.remove(&priority);
        }
        removed
    }

    fn insert(&mut self, priority: Priority, node_id: NodeId, container: Arc<RmContainer>) {
        self.reserved
            .entry(priority)
            .or_default()
            .insert(node_id, container);
    }

    fn account(ledger: &mut Ledger<'_>, container: &RmContainer) {
        let resource = container.reserved_resource();
        let partition = container.partition();
        ledger.usage.inc_reserved(&partition, resource);
        ledger.queue.inc_reserved_resource(&partition, resource);
    }

    fn unaccount(ledger: &mut Ledger<'_>, container: &RmContainer) {
        let resource = container.reserved_resource();
        let partition = container.partition();
        ledger.usage.dec_reserved(&partition, resource);
        ledger.queue.dec_reserved_resource(&partition, resource);
    }

    /// Reserve `node` at `priority`.
    ///
    /// `existing` is honoured as a re-reservation only if it is the container
    /// currently reserved at `(priority, node)`; a re-reservation bumps the
    /// re-reservation counter instead of the queue's reservation metric. If
    /// the node slot belongs to another attempt nothing changes.
    pub(crate) fn reserve(
        &mut self,
        ledger: &mut Ledger<'_>,
        priority: Priority,
        node: &SchedulerNode,
        existing: Option<Arc<RmContainer>>,
        container: Container,
    ) -> Result<Arc<RmContainer>, NodeError> {
        let rereserved = match existing {
            Some(e) if self.holds(priority, node.id(), &e) => Some(e),
            Some(e) => {
                warn!(
                    container = %e.id(),
                    node = %node.id(),
                    %priority,
                    "stale reservation reference, reserving afresh"
                );
                None
            }
            None => None,
        };

        let resource = container.resource;
        let partition = node.partition();
        let rm = match &rereserved {
            Some(e) => e.clone(),
            None => Arc::new(RmContainer::new(
                container,
                ledger.attempt_id.clone(),
                ledger.user,
                &partition,
            )),
        };

        let displaced = node.reserve_resource(ledger.attempt_id, priority, rm.clone())?;

        // The slot held another reservation of ours, possibly at a different
        // priority: it is gone now, so is its index entry.
        if let Some(d) = displaced.filter(|d| !d.holds(&rm)) {
            if let Some(old) = self.remove(d.priority, node.id()) {
                Self::unaccount(ledger, &old);
                ledger.queue.unreserve_resource(ledger.user, old.reserved_resource());
                debug!(container = %old.id(), node = %node.id(), "displaced reservation dropped");
            }
        }

        if rereserved.is_some() {
            Self::unaccount(ledger, &rm);
            rm.set_partition(&partition);
            self.add_re_reservation(priority);
        } else {
            ledger.queue.reserve_resource(ledger.user, resource);
        }

        rm.handle(ContainerEvent::Reserved {
            resource,
            node_id: node.id().clone(),
            priority,
        });
        Self::account(ledger, &rm);
        self.insert(priority, node.id().clone(), rm.clone());

        debug!(
            attempt = %ledger.attempt_id,
            container = %rm.id(),
            node = %node.id(),
            %priority,
            %resource,
            rereservation = rereserved.is_some(),
            "reserved"
        );
        Ok(rm)
    }

    /// Drop the reservation at `(priority, node)`.
    ///
    /// Reserved usage is released under the partition recorded on the
    /// reservation, which is the node's partition unless the node was
    /// relabelled since. Returns `false`, changing nothing, when there is none.
    pub(crate) fn unreserve(
        &mut self,
        ledger: &mut Ledger<'_>,
        priority: Priority,
        node: &SchedulerNode,
    ) -> bool {
        let Some(rm) = self.remove(priority, node.id()) else {
            return false;
        };

        self.reset_re_reservations(priority);
        Self::unaccount(ledger, &rm);
        node.unreserve_if_holds(&rm);
        ledger.queue.unreserve_resource(ledger.user, rm.reserved_resource());

        info!(
            attempt = %ledger.attempt_id,
            node = %node.id(),
            %priority,
            remaining = self.reserved.get(&priority).map_or(0, BTreeMap::len),
            current_reservation = %ledger.usage.total_reserved(),
            partition = %rm.partition(),
            "unreserved"
        );
        true
    }

    /// Relocate `container`'s reservation from `source` to `target`.
    ///
    /// All-or-nothing: on `false` the reservation is exactly where it was.
    pub(crate) fn move_reservation(
        &mut self,
        attempt_id: &AttemptId,
        container: &Arc<RmContainer>,
        source: &SchedulerNode,
        target: &SchedulerNode,
    ) -> bool {
        if source.partition() != target.partition() {
            debug!(
                source = %source.id(),
                target = %target.id(),
                "failed to move reservation, nodes are in different partitions"
            );
            return false;
        }

        let Some(priority) = container
            .reserved_priority()
            .filter(|p| self.reserved.contains_key(p))
        else {
            debug!(container = %container.id(), "cannot find reserved container map");
            return false;
        };

        if !source.is_reserved_by(container) || !self.holds(priority, source.id(), container) {
            debug!(container = %container.id(), "to-be-moved container already updated");
            return false;
        }

        if let Err(e) = target.reserve_if_vacant(attempt_id, priority, container.clone()) {
            debug!(error = %e, "target node is already occupied before moving");
            return false;
        }

        source.unreserve_if_holds(container);
        self.remove(priority, source.id());
        container.handle(ContainerEvent::Reserved {
            resource: container.reserved_resource(),
            node_id: target.id().clone(),
            priority,
        });
        self.insert(priority, target.id().clone(), container.clone());

        debug!(
            container = %container.id(),
            source = %source.id(),
            target = %target.id(),
            "moved reservation"
        );
        true
    }

    /// First reservation at `priority`, in node order, whose resource is at
    /// least `need` under `rc`.
    pub fn node_id_to_unreserve(
        &self,
        priority: Priority,
        need: Resource,
        rc: &dyn ResourceCalculator,
        cluster: Resource,
    ) -> Option<NodeId> {
        let at_priority = self.reserved.get(&priority)?;
        at_priority.iter().find_map(|(node_id, c)| {
            let reserved = c.reserved_resource();
            rc.less_than_or_equal(cluster, need, reserved).then(|| {
                debug!(
                    %node_id,
                    reservation = %reserved,
                    %need,
                    "unreserving node with reservation size to fit container"
                );
                node_id.clone()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::descriptor;
    use crate::queue::QueueUsage;
    use crate::usage::ResourceUsageTracker;
    use capgrid_core::DefaultResourceCalculator;

    struct Fixture {
        attempt: AttemptId,
        usage: ResourceUsageTracker,
        queue: QueueUsage,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                attempt: AttemptId::new("a1"),
                usage: ResourceUsageTracker::new(),
                queue: QueueUsage::new("root.default"),
            }
        }

        fn ledger(&mut self) -> Ledger<'_> {
            Ledger {
                attempt_id: &self.attempt,
                user: "alice",
                usage: &mut self.usage,
                queue: &self.queue,
            }
        }
    }

    fn node(id: &str, partition: &str) -> SchedulerNode {
        SchedulerNode::new(NodeId::new(id), "/rack1", partition, Resource::new(8192, 8))
    }

    #[test]
    fn reserve_then_unreserve_restores_state() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let usage_before = fx.usage.clone();

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        assert!(n1.is_reserved_by(&rm));
        assert_eq!(fx.usage.reserved(""), Resource::new(2048, 1));
        assert_eq!(fx.queue.metrics().reserved_containers, 1);

        assert!(mgr.unreserve(&mut fx.ledger(), Priority(1), &n1));
        assert!(mgr.is_empty());
        assert!(mgr.priorities().is_empty());
        assert!(n1.reservation().is_none());
        assert_eq!(fx.usage, usage_before);
        assert_eq!(fx.queue.metrics().reserved_containers, 0);
        assert_eq!(fx.queue.usage().reserved(""), Resource::zero());

        assert!(!mgr.unreserve(&mut fx.ledger(), Priority(1), &n1));
        assert_eq!(fx.usage, usage_before);
    }

    #[test]
    fn rereservation_does_not_double_count() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        let again = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, Some(rm.clone()), descriptor("c1", "n1", 2048, 1))
            .unwrap();

        assert!(Arc::ptr_eq(&rm, &again));
        assert_eq!(fx.queue.metrics().reserved_containers, 1);
        assert_eq!(fx.usage.reserved(""), Resource::new(2048, 1));
        assert_eq!(mgr.re_reservations(Priority(1)), 1);
        assert_eq!(mgr.len(), 1);

        mgr.unreserve(&mut fx.ledger(), Priority(1), &n1);
        assert_eq!(mgr.re_reservations(Priority(1)), 0);
    }

    #[test]
    fn reserve_on_foreign_slot_changes_nothing() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let foreign = Arc::new(RmContainer::new(
            descriptor("other", "n1", 1024, 1),
            AttemptId::new("a2"),
            "bob",
            "",
        ));
        n1.reserve_resource(&AttemptId::new("a2"), Priority(1), foreign.clone())
            .unwrap();

        let err = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap_err();
        assert!(matches!(err, NodeError::SlotOccupied { .. }));
        assert!(mgr.is_empty());
        assert_eq!(fx.usage.reserved(""), Resource::zero());
        assert_eq!(fx.queue.metrics().reserved_containers, 0);
        assert!(n1.is_reserved_by(&foreign));
    }

    #[test]
    fn reserving_same_node_at_other_priority_replaces_old_entry() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");

        mgr.reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        mgr.reserve(&mut fx.ledger(), Priority(2), &n1, None, descriptor("c2", "n1", 1024, 1))
            .unwrap();

        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.priorities(), vec![Priority(2)]);
        assert_eq!(fx.usage.reserved(""), Resource::new(1024, 1));
        assert_eq!(fx.queue.metrics().reserved_containers, 1);
    }

    #[test]
    fn move_reservation_relocates() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let n2 = node("n2", "");

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        assert!(mgr.move_reservation(&fx.attempt, &rm, &n1, &n2));

        assert!(n1.reservation().is_none());
        assert!(n2.is_reserved_by(&rm));
        assert_eq!(rm.node_id(), NodeId::new("n2"));
        assert!(mgr.get(Priority(1), &NodeId::new("n1")).is_none());
        assert!(mgr.get(Priority(1), &NodeId::new("n2")).is_some());
        assert_eq!(fx.usage.reserved(""), Resource::new(2048, 1));
    }

    #[test]
    fn move_to_occupied_target_fails_atomically() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let n2 = node("n2", "");
        let blocker = Arc::new(RmContainer::new(
            descriptor("other", "n2", 1024, 1),
            AttemptId::new("a2"),
            "bob",
            "",
        ));
        n2.reserve_resource(&AttemptId::new("a2"), Priority(1), blocker.clone())
            .unwrap();

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        assert!(!mgr.move_reservation(&fx.attempt, &rm, &n1, &n2));

        assert!(n1.is_reserved_by(&rm));
        assert!(n2.is_reserved_by(&blocker));
        assert_eq!(rm.node_id(), NodeId::new("n1"));
        assert!(mgr.get(Priority(1), &NodeId::new("n1")).is_some());
        assert!(mgr.get(Priority(1), &NodeId::new("n2")).is_none());
    }

    #[test]
    fn move_across_partitions_rejected() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let gpu = node("g1", "gpu");

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        assert!(!mgr.move_reservation(&fx.attempt, &rm, &n1, &gpu));
        assert!(n1.is_reserved_by(&rm));
        assert!(gpu.reservation().is_none());
    }

    #[test]
    fn move_with_stale_source_rejected() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let n1 = node("n1", "");
        let n2 = node("n2", "");
        let n3 = node("n3", "");

        let rm = mgr
            .reserve(&mut fx.ledger(), Priority(1), &n1, None, descriptor("c1", "n1", 2048, 1))
            .unwrap();
        assert!(mgr.move_reservation(&fx.attempt, &rm, &n1, &n2));
        // n1 no longer holds it.
        assert!(!mgr.move_reservation(&fx.attempt, &rm, &n1, &n3));
        assert!(n3.reservation().is_none());
    }

    #[test]
    fn first_fit_unreserve_selection() {
        let mut fx = Fixture::new();
        let mut mgr = ReservationManager::new();
        let nodes = [node("n1", ""), node("n2", ""), node("n3", "")];
        for (i, (n, mb)) in nodes.iter().zip([1024, 2048, 3072]).enumerate() {
            mgr.reserve(
                &mut fx.ledger(),
                Priority(1),
                n,
                None,
                descriptor(&format!("c{i}"), n.id().as_str(), mb, 1),
            )
            .unwrap();
        }
        let rc = DefaultResourceCalculator;
        let cluster = Resource::new(3 * 8192, 24);

        let picked = mgr.node_id_to_unreserve(Priority(1), Resource::new(2560, 1), &rc, cluster);
        assert_eq!(picked, Some(NodeId::new("n3")));

        let picked = mgr.node_id_to_unreserve(Priority(1), Resource::new(1024, 1), &rc, cluster);
        assert_eq!(picked, Some(NodeId::new("n1")));

        assert_eq!(
            mgr.node_id_to_unreserve(Priority(1), Resource::new(4096, 1), &rc, cluster),
            None
        );
        assert_eq!(
            mgr.node_id_to_unreserve(Priority(7), Resource::new(1, 1), &rc, cluster),
            None
        );
    }
}
