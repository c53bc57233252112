//! Attempt bookkeeping error types.
//!
//! Expected scheduling races are reported through `Option`/`bool` results,
//! not through these errors.

use capgrid_core::{AttemptId, ContainerId, NodeId};
use thiserror::Error;

/// Conflicts on a node's single reservation slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("node {node} already holds a reservation for attempt {holder}")]
    SlotOccupied { node: NodeId, holder: AttemptId },
}

/// Errors that can occur during attempt bookkeeping operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("container is already live: {0}")]
    ContainerAlreadyLive(ContainerId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node error: {0}")]
    Node(#[from] NodeError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
