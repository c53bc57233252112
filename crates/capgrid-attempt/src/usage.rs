//! Per-partition resource accounting.
//!
//! [`ResourceUsageTracker`] is plain data: it is only ever mutated through
//! `&mut`, so every increment/decrement is atomic with respect to whatever
//! lock owns the tracker (the attempt lock, or a queue's lock).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use capgrid_core::{AttemptId, Resource};
use serde::{Deserialize, Serialize};

use crate::queue::Queue;

/// Resource figures of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub used: Resource,
    pub reserved: Resource,
    pub am_used: Resource,
    /// Resource the application master asked for in this partition.
    pub am_resource: Resource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageTracker {
    partitions: BTreeMap<String, PartitionUsage>,
}

impl ResourceUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, partition: &str) -> &mut PartitionUsage {
        self.partitions.entry(partition.to_string()).or_default()
    }

    /// Drop a partition whose figures are all zero.
    fn prune(&mut self, partition: &str) {
        if self.partitions.get(partition) == Some(&PartitionUsage::default()) {
            self.partitions.remove(partition);
        }
    }

    pub fn partition(&self, partition: &str) -> PartitionUsage {
        self.partitions.get(partition).copied().unwrap_or_default()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&str, &PartitionUsage)> {
        self.partitions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn used(&self, partition: &str) -> Resource {
        self.partition(partition).used
    }

    pub fn reserved(&self, partition: &str) -> Resource {
        self.partition(partition).reserved
    }

    pub fn am_used(&self, partition: &str) -> Resource {
        self.partition(partition).am_used
    }

    pub fn am_resource(&self, partition: &str) -> Resource {
        self.partition(partition).am_resource
    }

    pub fn total_used(&self) -> Resource {
        self.partitions.values().map(|p| p.used).sum()
    }

    pub fn total_reserved(&self) -> Resource {
        self.partitions.values().map(|p| p.reserved).sum()
    }

    pub fn inc_used(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).used += resource;
    }

    pub fn dec_used(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).used -= resource;
        self.prune(partition);
    }

    pub fn inc_reserved(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).reserved += resource;
    }

    pub fn dec_reserved(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).reserved -= resource;
        self.prune(partition);
    }

    pub fn inc_am_used(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).am_used += resource;
    }

    pub fn dec_am_used(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).am_used -= resource;
        self.prune(partition);
    }

    pub fn set_am_resource(&mut self, partition: &str, resource: Resource) {
        self.entry(partition).am_resource = resource;
    }

    /// Move `resource` of used from one partition to another in one step.
    pub fn move_used(&mut self, from: &str, to: &str, resource: Resource) {
        self.dec_used(from, resource);
        self.inc_used(to, resource);
    }

    pub fn move_am_used(&mut self, from: &str, to: &str, resource: Resource) {
        self.dec_am_used(from, resource);
        self.inc_am_used(to, resource);
    }
}

/// Mutable accounting handles an attempt lends to its components while its
/// lock is held.
pub(crate) struct Ledger<'a> {
    pub attempt_id: &'a AttemptId,
    pub user: &'a str,
    pub usage: &'a mut ResourceUsageTracker,
    pub queue: &'a dyn Queue,
}

/// Resource-time integral of an attempt's usage.
///
/// Usage accrues continuously; a computed report is cached until it is
/// invalidated or older than the refresh interval.
#[derive(Debug, Clone)]
pub(crate) struct AggregateUsage {
    memory_mb_seconds: f64,
    vcore_seconds: f64,
    last_accrued: Instant,
    /// When the cached report was computed; `None` forces a recompute.
    report_at: Option<Instant>,
    cached: (u64, u64),
}

impl AggregateUsage {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            memory_mb_seconds: 0.0,
            vcore_seconds: 0.0,
            last_accrued: now,
            report_at: None,
            cached: (0, 0),
        }
    }

    /// Account for `used` having been held since the last accrual.
    pub(crate) fn accrue(&mut self, now: Instant, used: Resource) {
        let elapsed = now.saturating_duration_since(self.last_accrued).as_secs_f64();
        self.memory_mb_seconds += used.memory_mb as f64 * elapsed;
        self.vcore_seconds += f64::from(used.vcores) * elapsed;
        self.last_accrued = now;
    }

    pub(crate) fn invalidate(&mut self) {
        self.report_at = None;
    }

    pub(crate) fn is_cached(&self, now: Instant, refresh: Duration) -> bool {
        self.report_at
            .is_some_and(|at| now.saturating_duration_since(at) < refresh)
    }

    /// `(memory_mb_seconds, vcore_seconds)`, recomputed when stale.
    pub(crate) fn report(&mut self, now: Instant, refresh: Duration, used: Resource) -> (u64, u64) {
        if !self.is_cached(now, refresh) {
            self.accrue(now, used);
            self.cached = (self.memory_mb_seconds as u64, self.vcore_seconds as u64);
            self.report_at = Some(now);
        }
        self.cached
    }
}

/// Point-in-time resource report of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub num_used_containers: usize,
    pub num_reserved_containers: usize,
    pub used: Resource,
    pub reserved: Resource,
    pub needed: Resource,
    pub memory_mb_seconds: u64,
    pub vcore_seconds: u64,
    /// Share of the queue's capacity in the AM partition, in percent.
    pub queue_usage_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_independent() {
        let mut usage = ResourceUsageTracker::new();
        usage.inc_used("x", Resource::new(1024, 1));
        usage.inc_used("x", Resource::new(1024, 1));
        usage.inc_reserved("", Resource::new(2048, 1));

        assert_eq!(usage.used("x"), Resource::new(2048, 2));
        assert_eq!(usage.used(""), Resource::zero());
        assert_eq!(usage.reserved(""), Resource::new(2048, 1));
        assert_eq!(usage.total_used(), Resource::new(2048, 2));
        assert_eq!(usage.total_reserved(), Resource::new(2048, 1));
    }

    #[test]
    fn zeroed_partitions_are_pruned() {
        let before = ResourceUsageTracker::new();
        let mut usage = before.clone();
        usage.inc_reserved("", Resource::new(2048, 1));
        usage.dec_reserved("", Resource::new(2048, 1));
        assert_eq!(usage, before);
        assert_eq!(usage.partitions().count(), 0);
    }

    #[test]
    fn move_used_preserves_total() {
        let mut usage = ResourceUsageTracker::new();
        usage.inc_used("old", Resource::new(3072, 3));
        usage.move_used("old", "new", Resource::new(1024, 1));

        assert_eq!(usage.used("old"), Resource::new(2048, 2));
        assert_eq!(usage.used("new"), Resource::new(1024, 1));
        assert_eq!(usage.total_used(), Resource::new(3072, 3));
    }

    #[test]
    fn am_figures_tracked_separately() {
        let mut usage = ResourceUsageTracker::new();
        usage.set_am_resource("", Resource::new(1024, 1));
        usage.inc_am_used("", Resource::new(1024, 1));
        usage.move_am_used("", "gpu", Resource::new(1024, 1));

        assert_eq!(usage.am_resource(""), Resource::new(1024, 1));
        assert_eq!(usage.am_used(""), Resource::zero());
        assert_eq!(usage.am_used("gpu"), Resource::new(1024, 1));
        assert_eq!(usage.used("gpu"), Resource::zero());
    }

    #[test]
    fn aggregate_accrues_resource_seconds() {
        let start = Instant::now();
        let mut agg = AggregateUsage::new(start);
        agg.accrue(start + Duration::from_secs(10), Resource::new(1024, 2));

        let report = agg.report(start + Duration::from_secs(10), Duration::from_secs(3), Resource::zero());
        assert_eq!(report, (10 * 1024, 20));
    }

    #[test]
    fn aggregate_report_is_cached_until_invalidated() {
        let start = Instant::now();
        let refresh = Duration::from_secs(3);
        let used = Resource::new(1000, 1);
        let mut agg = AggregateUsage::new(start);

        let first = agg.report(start + Duration::from_secs(1), refresh, used);
        assert_eq!(first, (1000, 1));

        // Within the refresh window the cached figure is returned.
        let second = agg.report(start + Duration::from_secs(2), refresh, used);
        assert_eq!(second, first);

        agg.invalidate();
        let third = agg.report(start + Duration::from_secs(2), refresh, used);
        assert_eq!(third, (2000, 2));
    }
}
