//! Queue-scope metrics sink.
//!
//! The owning queue mirrors an attempt's used / reserved / AM-used figures
//! and keeps the container metrics operators look at. [`QueueUsage`] is the
//! in-process implementation.

use capgrid_core::{AttemptId, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::usage::ResourceUsageTracker;

pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// A node reservation was made for `user` (first reservation only).
    fn reserve_resource(&self, user: &str, resource: Resource);

    fn unreserve_resource(&self, user: &str, resource: Resource);

    fn inc_reserved_resource(&self, partition: &str, resource: Resource);

    fn dec_reserved_resource(&self, partition: &str, resource: Resource);

    /// `containers` containers of `user` completed, returning `resource`.
    fn release_resources(&self, user: &str, containers: u32, resource: Resource);

    fn inc_used_resource(&self, partition: &str, resource: Resource, attempt: &AttemptId);

    fn dec_used_resource(&self, partition: &str, resource: Resource, attempt: &AttemptId);

    fn inc_am_used_resource(&self, partition: &str, resource: Resource, attempt: &AttemptId);

    fn dec_am_used_resource(&self, partition: &str, resource: Resource, attempt: &AttemptId);
}

/// Container-level counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub reserved_containers: u64,
    pub reserved: Resource,
    pub released_containers: u64,
    pub released: Resource,
}

#[derive(Debug, Default)]
struct QueueState {
    metrics: QueueMetrics,
    usage: ResourceUsageTracker,
}

#[derive(Debug)]
pub struct QueueUsage {
    name: String,
    state: Mutex<QueueState>,
}

impl QueueUsage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.state.lock().metrics
    }

    pub fn usage(&self) -> ResourceUsageTracker {
        self.state.lock().usage.clone()
    }
}

impl Queue for QueueUsage {
    fn name(&self) -> &str {
        &self.name
    }

    fn reserve_resource(&self, user: &str, resource: Resource) {
        let mut state = self.state.lock();
        state.metrics.reserved_containers += 1;
        state.metrics.reserved += resource;
        debug!(queue = %self.name, %user, %resource, "reservation metric incremented");
    }

    fn unreserve_resource(&self, user: &str, resource: Resource) {
        let mut state = self.state.lock();
        state.metrics.reserved_containers = state.metrics.reserved_containers.saturating_sub(1);
        state.metrics.reserved -= resource;
        debug!(queue = %self.name, %user, %resource, "reservation metric decremented");
    }

    fn inc_reserved_resource(&self, partition: &str, resource: Resource) {
        self.state.lock().usage.inc_reserved(partition, resource);
    }

    fn dec_reserved_resource(&self, partition: &str, resource: Resource) {
        self.state.lock().usage.dec_reserved(partition, resource);
    }

    fn release_resources(&self, user: &str, containers: u32, resource: Resource) {
        let mut state = self.state.lock();
        state.metrics.released_containers += u64::from(containers);
        state.metrics.released += resource;
        debug!(queue = %self.name, %user, containers, %resource, "resources released");
    }

    fn inc_used_resource(&self, partition: &str, resource: Resource, _attempt: &AttemptId) {
        self.state.lock().usage.inc_used(partition, resource);
    }

    fn dec_used_resource(&self, partition: &str, resource: Resource, _attempt: &AttemptId) {
        self.state.lock().usage.dec_used(partition, resource);
    }

    fn inc_am_used_resource(&self, partition: &str, resource: Resource, _attempt: &AttemptId) {
        self.state.lock().usage.inc_am_used(partition, resource);
    }

    fn dec_am_used_resource(&self, partition: &str, resource: Resource, _attempt: &AttemptId) {
        self.state.lock().usage.dec_am_used(partition, resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_metrics_round_trip() {
        let q = QueueUsage::new("root.default");
        q.reserve_resource("alice", Resource::new(2048, 1));
        assert_eq!(q.metrics().reserved_containers, 1);
        assert_eq!(q.metrics().reserved, Resource::new(2048, 1));

        q.unreserve_resource("alice", Resource::new(2048, 1));
        assert_eq!(q.metrics(), QueueMetrics::default());
    }

    #[test]
    fn used_tracked_per_partition() {
        let q = QueueUsage::new("root.default");
        let a = AttemptId::new("a1");
        q.inc_used_resource("x", Resource::new(1024, 1), &a);
        q.inc_used_resource("", Resource::new(512, 1), &a);
        q.dec_used_resource("x", Resource::new(1024, 1), &a);

        let usage = q.usage();
        assert_eq!(usage.used("x"), Resource::zero());
        assert_eq!(usage.used(""), Resource::new(512, 1));
        assert_eq!(q.name(), "root.default");
    }
}
