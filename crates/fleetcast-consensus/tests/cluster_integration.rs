//! Multi-node cluster tests on loopback ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetcast_consensus::api::{
    serve_api, ApiOptions, MediaEndpoint, NullFileLister, NullResourceSampler,
};
use fleetcast_consensus::{Cluster, ClusterOptions};
use fleetcast_core::process::ProcessConfig;
use fleetcast_core::ErrorKind;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

struct TestNode {
    cluster: Arc<Cluster>,
    _api_shutdown: tokio::sync::oneshot::Sender<()>,
    _dir: TempDir,
}

/// Reserves a raft/api port pair on loopback.
fn free_port_pair() -> u16 {
    loop {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        if port >= u16::MAX - 1 {
            continue;
        }
        if std::net::TcpListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return port;
        }
    }
}

async fn start_node(id: u64, raft_port: u16, bootstrap: bool, join: Option<String>) -> TestNode {
    let dir = TempDir::new().unwrap();
    let raft_address: SocketAddr = format!("127.0.0.1:{raft_port}").parse().unwrap();

    let cluster = Cluster::new(ClusterOptions {
        node_id: id,
        name: format!("node-{id}"),
        path: dir.path().to_path_buf(),
        raft_address,
        bootstrap,
        join_address: join,
        username: "cluster".to_string(),
        password: "pw".to_string(),
    })
    .await
    .unwrap();

    let api_address = Cluster::api_addr(&raft_address.to_string()).unwrap();
    let api_shutdown = serve_api(
        api_address.parse().unwrap(),
        ApiOptions {
            cluster: cluster.clone(),
            name: format!("node-{id}"),
            username: "cluster".to_string(),
            password: "pw".to_string(),
            rtmp: MediaEndpoint::default(),
            srt: MediaEndpoint::default(),
            mem_fs: Arc::new(NullFileLister),
            disk_fs: Arc::new(NullFileLister),
            rtmp_channels: None,
            srt_channels: None,
            sampler: Arc::new(NullResourceSampler),
        },
    )
    .await
    .unwrap();

    TestNode { cluster, _api_shutdown: api_shutdown, _dir: dir }
}

async fn wait_for<F: Fn() -> bool>(what: &str, budget: Duration, check: F) {
    let result = timeout(budget, async {
        while !check() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

fn process(id: &str, domain: &str) -> ProcessConfig {
    ProcessConfig { id: id.to_string(), domain: domain.to_string(), ..Default::default() }
}

#[tokio::test]
async fn test_bootstrap_join_and_replication() {
    let port_a = free_port_pair();
    let port_b = free_port_pair();

    let a = start_node(1, port_a, true, None).await;
    wait_for("A to become leader", Duration::from_secs(10), || a.cluster.is_raft_leader()).await;
    assert!(!a.cluster.is_degraded());

    let b = start_node(2, port_b, false, Some(format!("127.0.0.1:{port_a}"))).await;
    wait_for("B to join", Duration::from_secs(15), || {
        b.cluster.has_raft_leader() && b.cluster.store().node_list().len() == 1
    })
    .await;

    // A mutation submitted to the follower lands in both state machines.
    b.cluster.add_process(None, process("p1", "d")).await.unwrap();

    wait_for("replication to B", Duration::from_secs(5), || {
        b.cluster.store().process_list().len() == 1
    })
    .await;
    assert_eq!(a.cluster.store().process_list().len(), 1);

    // A duplicate is rejected wherever it is submitted.
    let err = a.cluster.add_process(None, process("p1", "d")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // Identical logs produce byte-identical states.
    wait_for("states to converge", Duration::from_secs(5), || {
        a.cluster.store().snapshot_bytes().unwrap() == b.cluster.store().snapshot_bytes().unwrap()
    })
    .await;

    a.cluster.shutdown().await;
    b.cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_leave_transfers_leadership() {
    let port_a = free_port_pair();
    let port_b = free_port_pair();

    let a = start_node(1, port_a, true, None).await;
    wait_for("A to become leader", Duration::from_secs(10), || a.cluster.is_raft_leader()).await;

    let b = start_node(2, port_b, false, Some(format!("127.0.0.1:{port_a}"))).await;
    wait_for("B to join", Duration::from_secs(15), || b.cluster.has_raft_leader()).await;

    a.cluster.leave(None, None).await.unwrap();

    wait_for("B to take over", Duration::from_secs(10), || b.cluster.is_raft_leader()).await;
    assert!(!a.cluster.is_raft_leader());

    a.cluster.shutdown().await;
    b.cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_voter_leave_is_noop() {
    let port = free_port_pair();

    let a = start_node(1, port, true, None).await;
    wait_for("A to become leader", Duration::from_secs(10), || a.cluster.is_raft_leader()).await;

    a.cluster.leave(None, None).await.unwrap();

    // a cluster of one cannot leave itself
    assert!(a.cluster.is_raft_leader());

    a.cluster.shutdown().await;
}

#[tokio::test]
async fn test_mutations_refused_without_leader() {
    let port = free_port_pair();

    // not bootstrapped, no join target: no leader ever appears
    let a = start_node(1, port, false, None).await;

    assert!(a.cluster.is_degraded());
    let err = a.cluster.add_process(None, process("p1", "d")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Degraded);

    a.cluster.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_round_trip_over_the_api() {
    let port = free_port_pair();

    let a = start_node(1, port, true, None).await;
    wait_for("A to become leader", Duration::from_secs(10), || a.cluster.is_raft_leader()).await;

    a.cluster.add_process(None, process("p1", "d")).await.unwrap();
    a.cluster.set_kv("k".to_string(), "v".to_string()).await.unwrap();

    let blob = a.cluster.snapshot().await.unwrap();

    // The blob is the store's own canonical dump.
    assert_eq!(blob, a.cluster.store().snapshot_bytes().unwrap());

    a.cluster.shutdown().await;
}
