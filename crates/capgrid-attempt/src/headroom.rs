//! Headroom providers.
//!
//! The owning queue injects a [`HeadroomProvider`] into each attempt; when
//! none is injected the attempt falls back to the limit last pushed to it
//! with `set_headroom`.

use std::sync::Arc;

use capgrid_core::Resource;

use crate::queue::QueueUsage;

/// Resource still available to an attempt before it hits its limit.
pub trait HeadroomProvider: Send + Sync {
    fn headroom(&self) -> Resource;
}

/// Headroom bounded by a queue's limit in one partition, minus what the
/// queue already uses there.
#[derive(Debug, Clone)]
pub struct QueueHeadroomProvider {
    queue: Arc<QueueUsage>,
    partition: String,
    limit: Resource,
}

impl QueueHeadroomProvider {
    pub fn new(queue: Arc<QueueUsage>, partition: &str, limit: Resource) -> Self {
        Self {
            queue,
            partition: partition.to_string(),
            limit,
        }
    }
}

impl HeadroomProvider for QueueHeadroomProvider {
    fn headroom(&self) -> Resource {
        self.limit - self.queue.usage().used(&self.partition)
    }
}
