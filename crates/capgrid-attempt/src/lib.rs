//! capgrid-attempt — per-attempt container bookkeeping for a capacity
//! scheduler.
//!
//! One [`ApplicationAttemptState`] per application attempt tracks:
//!
//! - Live containers and the containers allocated since the last heartbeat
//! - Node reservations, at most one per node across all attempts
//! - Preemption marks, delivered exactly once
//! - Per-partition used / reserved / AM-used resources, mirrored to the queue
//!
//! # Architecture
//!
//! ```text
//! ApplicationAttemptState (one mutex)
//!   ├── ContainerAllocator  (live map, newly allocated)
//!   ├── ReservationManager  (priority → node → container)
//!   ├── PreemptionTracker   (marked ids)
//!   ├── ResourceUsageTracker
//!   └── collaborators
//!       ├── Queue               (queue-scope metrics)
//!       ├── NodeLookup          (node id → SchedulerNode)
//!       ├── HeadroomProvider    (optional)
//!       └── PendingRequestTracker
//! ```

pub mod allocation;
pub mod allocator;
pub mod attempt;
pub mod container;
pub mod diagnostics;
pub mod error;
pub mod headroom;
pub mod node;
pub mod preemption;
pub mod queue;
pub mod requests;
pub mod reservation;
pub mod usage;

pub use allocation::Allocation;
pub use attempt::{ApplicationAttemptState, AttemptContext};
pub use container::{CompletionEvent, Container, ContainerState, ContainerStatus, RmContainer};
pub use diagnostics::{AmState, QueueAmLimits, QueueCapacities};
pub use error::{NodeError, SchedulerError, SchedulerResult};
pub use headroom::{HeadroomProvider, QueueHeadroomProvider};
pub use node::{NodeLookup, NodeRegistry, NodeReservation, SchedulerNode};
pub use queue::{Queue, QueueMetrics, QueueUsage};
pub use requests::{AppSchedulingInfo, PendingRequestTracker, ResourceRequest};
pub use usage::{PartitionUsage, ResourceUsageTracker, UsageReport};
