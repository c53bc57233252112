//! Container records shared between an attempt and the nodes it touches.
//!
//! A [`Container`] is the plain descriptor a scheduling pass hands in after
//! the node accepted the offer. An [`RmContainer`] wraps it with the mutable
//! lifecycle the attempt drives through [`ContainerEvent`]s.
//!
//! The record's own lock is a leaf: nothing else is locked while it is held.

use capgrid_core::{AttemptId, ContainerId, NodeId, Priority, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::requests::ResourceRequest;

/// Container descriptor supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub node_id: NodeId,
    pub resource: Resource,
    pub priority: Priority,
    /// Whether this container hosts the application master.
    #[serde(default)]
    pub is_am_container: bool,
    /// Opaque node access token, delivered untouched with the container.
    #[serde(default)]
    pub node_token: Option<String>,
}

/// Lifecycle state of a container as seen by this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    New,
    Reserved,
    Allocated,
    Acquired,
    Completed,
}

/// Why a container left the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionEvent {
    Finished,
    Released,
    Killed,
    Expired,
    Preempted,
}

/// Final status reported by the node for a completed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub exit_status: i32,
    pub diagnostics: String,
}

impl ContainerStatus {
    pub fn new(exit_status: i32, diagnostics: impl Into<String>) -> Self {
        Self {
            exit_status,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Lifecycle events sent to an [`RmContainer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    Start,
    /// Reserved, re-reserved, or relocated to `node_id`.
    Reserved {
        resource: Resource,
        node_id: NodeId,
        priority: Priority,
    },
    Acquired,
    Finished {
        status: ContainerStatus,
        event: CompletionEvent,
    },
}

#[derive(Debug)]
struct Inner {
    state: ContainerState,
    node_id: NodeId,
    partition: String,
    reserved_resource: Resource,
    reserved_priority: Option<Priority>,
    resource_requests: Vec<ResourceRequest>,
    completion: Option<(ContainerStatus, CompletionEvent)>,
}

/// A container owned by one application attempt.
#[derive(Debug)]
pub struct RmContainer {
    container: Container,
    attempt_id: AttemptId,
    user: String,
    inner: Mutex<Inner>,
}

impl RmContainer {
    /// Create a record in the `New` state on `partition`.
    pub fn new(container: Container, attempt_id: AttemptId, user: &str, partition: &str) -> Self {
        let inner = Inner {
            state: ContainerState::New,
            node_id: container.node_id.clone(),
            partition: partition.to_string(),
            reserved_resource: Resource::zero(),
            reserved_priority: None,
            resource_requests: Vec::new(),
            completion: None,
        };
        Self {
            container,
            attempt_id,
            user: user.to_string(),
            inner: Mutex::new(inner),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.container.id
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn allocated_resource(&self) -> Resource {
        self.container.resource
    }

    pub fn priority(&self) -> Priority {
        self.container.priority
    }

    pub fn is_am_container(&self) -> bool {
        self.container.is_am_container
    }

    pub fn state(&self) -> ContainerState {
        self.inner.lock().state
    }

    /// The node currently holding this container or its reservation.
    pub fn node_id(&self) -> NodeId {
        self.inner.lock().node_id.clone()
    }

    pub fn partition(&self) -> String {
        self.inner.lock().partition.clone()
    }

    pub(crate) fn set_partition(&self, partition: &str) {
        self.inner.lock().partition = partition.to_string();
    }

    pub fn reserved_resource(&self) -> Resource {
        self.inner.lock().reserved_resource
    }

    pub fn reserved_priority(&self) -> Option<Priority> {
        self.inner.lock().reserved_priority
    }

    pub fn resource_requests(&self) -> Vec<ResourceRequest> {
        self.inner.lock().resource_requests.clone()
    }

    pub(crate) fn set_resource_requests(&self, requests: Vec<ResourceRequest>) {
        self.inner.lock().resource_requests = requests;
    }

    pub fn completion(&self) -> Option<(ContainerStatus, CompletionEvent)> {
        self.inner.lock().completion.clone()
    }

    /// Apply a lifecycle event.
    pub fn handle(&self, event: ContainerEvent) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        match event {
            ContainerEvent::Start => inner.state = ContainerState::Allocated,
            ContainerEvent::Reserved {
                resource,
                node_id,
                priority,
            } => {
                inner.state = ContainerState::Reserved;
                inner.reserved_resource = resource;
                inner.reserved_priority = Some(priority);
                inner.node_id = node_id;
            }
            ContainerEvent::Acquired => {
                if inner.state == ContainerState::Allocated {
                    inner.state = ContainerState::Acquired;
                }
            }
            ContainerEvent::Finished { status, event } => {
                inner.state = ContainerState::Completed;
                inner.completion = Some((status, event));
            }
        }
        debug!(
            container = %self.container.id,
            node = %inner.node_id,
            ?from,
            to = ?inner.state,
            "container transition"
        );
    }
}
