//! capgridd — drives capgrid attempt bookkeeping over a simulated cluster.
//!
//! - `cluster` — TOML cluster description (nodes, queues, attempts)
//! - `simulate` — concurrent scheduling passes, preemption and heartbeats

pub mod cluster;
pub mod simulate;

pub use cluster::ClusterConfig;
pub use simulate::{Simulation, SimulationReport, run};
