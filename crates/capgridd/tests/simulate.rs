//! Simulation scenarios driven through the public `capgridd` API.

use std::collections::HashSet;
use std::io::Write;

use capgrid_core::{ContainerId, Resource};
use capgridd::{ClusterConfig, Simulation};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

const TWO_NODES: &str = r#"
[simulation]
workers = 2
heartbeats = 5
heartbeat_interval_ms = 1

[[nodes]]
id = "n1"
memory_mb = 4096
vcores = 4

[[nodes]]
id = "n2"
memory_mb = 4096
vcores = 4

[[queues]]
name = "root.default"

[[attempts]]
id = "a1"
user = "alice"
queue = "root.default"

[[attempts.requests]]
priority = 1
resource_name = "*"
capability = { memory_mb = 1024, vcores = 1 }
num_containers = 8
"#;

const CONTENDED: &str = r#"
[simulation]
workers = 1
heartbeats = 6
heartbeat_interval_ms = 1
preempt_every = 1

[[nodes]]
id = "n1"
memory_mb = 4096
vcores = 4

[[queues]]
name = "root.default"

[[attempts]]
id = "a1"
user = "alice"
queue = "root.default"

[[attempts.requests]]
priority = 1
resource_name = "*"
capability = { memory_mb = 4096, vcores = 1 }
num_containers = 1

[[attempts]]
id = "a2"
user = "bob"
queue = "root.default"

[[attempts.requests]]
priority = 1
resource_name = "*"
capability = { memory_mb = 1024, vcores = 1 }
num_containers = 4
"#;

#[test]
fn config_loads_from_file() {
    let file = write_config(TWO_NODES);
    let config = ClusterConfig::from_file(file.path()).unwrap();
    assert_eq!(config.nodes.len(), 2);
    assert_eq!(config.cluster_resource(), Resource::new(8192, 8));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = ClusterConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("absent.toml"));
}

#[tokio::test]
async fn containers_delivered_exactly_once() {
    let config = ClusterConfig::from_toml_str(TWO_NODES).unwrap();
    let report = capgridd::run(config).await.unwrap();

    let delivered: Vec<ContainerId> = report
        .heartbeats
        .iter()
        .flat_map(|r| r.allocation.containers.iter().map(|c| c.id.clone()))
        .collect();
    let unique: HashSet<_> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), 8);
    assert_eq!(unique.len(), 8);
    assert_eq!(report.passes.allocated, 8);

    let summary = &report.attempts[0];
    assert_eq!(summary.live_containers, 8);
    assert_eq!(summary.usage.used, Resource::new(8192, 8));
    assert!(summary.pending.is_zero());
}

#[tokio::test]
async fn starving_attempt_triggers_preemption() {
    let config = ClusterConfig::from_toml_str(CONTENDED).unwrap();
    let report = capgridd::run(config).await.unwrap();

    assert!(report.preempted >= 1);
    let marked: usize = report
        .heartbeats
        .iter()
        .map(|r| r.allocation.preempted.len())
        .sum();
    assert_eq!(marked as u64, report.preempted);

    let record = report
        .heartbeats
        .iter()
        .find(|r| !r.allocation.preempted.is_empty())
        .unwrap();
    assert_eq!(record.attempt.as_str(), "a2");
    assert_eq!(record.allocation.release_requests.len(), 1);
    assert_eq!(record.allocation.release_requests[0].num_containers, 1);

    for summary in &report.attempts {
        assert_eq!(
            summary.usage.used.memory_mb,
            summary.live_containers as u64 * if summary.attempt.as_str() == "a1" { 4096 } else { 1024 }
        );
    }
}

#[test]
fn node_capacity_matches_live_containers() {
    let config = ClusterConfig::from_toml_str(CONTENDED).unwrap();
    let sim = Simulation::build(config).unwrap();

    for round in 1..=4 {
        sim.scheduling_pass(0, round);
        sim.preemption_pass();
        sim.heartbeat(round);
    }

    let live: Resource = sim
        .attempts()
        .iter()
        .flat_map(|a| a.live_containers())
        .map(|c| c.allocated_resource())
        .sum();
    let nodes = sim.nodes().nodes();
    let node = &nodes[0];
    assert_eq!(node.total_resource() - node.available_resource(), live);

    let queue = sim.queue("root.default").unwrap();
    assert_eq!(queue.usage().used(""), live);
}
