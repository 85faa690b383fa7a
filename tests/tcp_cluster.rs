//! TCP cluster integration tests
//!
//! These tests spin up a loopback cluster whose nodes exchange framed JSON
//! messages over TCP, and drive it through the client HTTP API.

use std::net::SocketAddr;
use std::time::Duration;

use raftline::api::client_http::{ErrorResponse, LeaderResponse, SubmitResponse};
use raftline::core::controller::NodeStatus;
use raftline::core::machine::RaftState;
use raftline::testing::TcpTestCluster;

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);

// HTTP client helpers

async fn get_status(
    client: &reqwest::Client,
    addr: &SocketAddr,
) -> Result<NodeStatus, reqwest::Error> {
    client
        .get(format!("http://{}/client/status", addr))
        .send()
        .await?
        .json()
        .await
}

async fn get_leader(
    client: &reqwest::Client,
    addr: &SocketAddr,
) -> Result<LeaderResponse, reqwest::Error> {
    client
        .get(format!("http://{}/client/leader", addr))
        .send()
        .await?
        .json()
        .await
}

async fn submit_command(
    client: &reqwest::Client,
    addr: &SocketAddr,
    command: &str,
) -> reqwest::Response {
    client
        .post(format!("http://{}/client/submit", addr))
        .json(&serde_json::json!({ "command": command }))
        .send()
        .await
        .unwrap()
}

/// Wait until `count` entries are applied on every running node
async fn wait_for_applied_everywhere(cluster: &TcpTestCluster, ids: &[usize], count: usize) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if ids
            .iter()
            .all(|&id| cluster.nodes[id].node.applied.lock().len() >= count)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_tcp_cluster_elects_leader() {
    let cluster = TcpTestCluster::with_nodes(3).await;
    let client = reqwest::Client::new();

    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.expect("no leader");
    let status = get_status(&client, &cluster.nodes[leader].api_addr)
        .await
        .unwrap();
    assert_eq!(status.id, leader);
    assert_eq!(status.role, RaftState::Leader);
    assert!(status.term >= 1);

    let info = get_leader(&client, &cluster.nodes[leader].api_addr)
        .await
        .unwrap();
    assert!(info.is_leader);
    assert_eq!(info.leader_id, Some(leader));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_over_http_replicates_to_all() {
    let cluster = TcpTestCluster::with_nodes(3).await;
    let client = reqwest::Client::new();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.expect("no leader");
    let leader_addr = cluster.nodes[leader].api_addr;

    for i in 0..5 {
        let response = submit_command(&client, &leader_addr, &format!("SET k{} {}", i, i)).await;
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let accepted: SubmitResponse = response.json().await.unwrap();
        assert_eq!(accepted.node_id, leader);
    }

    assert!(wait_for_applied_everywhere(&cluster, &[0, 1, 2], 5).await);
    let expected: Vec<String> = (0..5).map(|i| format!("SET k{} {}", i, i)).collect();
    for node in &cluster.nodes {
        assert_eq!(node.node.applied_commands(), expected);
    }

    for addr in cluster.api_addrs() {
        let status = get_status(&client, &addr).await.unwrap();
        assert_eq!(status.commit_index, 4);
        assert_eq!(status.log_len, 5);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_redirect() {
    let cluster = TcpTestCluster::with_nodes(3).await;
    let client = reqwest::Client::new();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.expect("no leader");

    // Let a heartbeat establish the leader on every follower
    tokio::time::sleep(Duration::from_millis(200)).await;

    let follower = (leader + 1) % 3;
    let response = submit_command(&client, &cluster.nodes[follower].api_addr, "SET x 1").await;
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.error, "Not the leader");
    assert_eq!(error.leader_hint, Some(leader));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_failover() {
    let mut cluster = TcpTestCluster::with_nodes(3).await;
    let client = reqwest::Client::new();
    let old_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.expect("no leader");

    let response = submit_command(&client, &cluster.nodes[old_leader].api_addr, "SET a 1").await;
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(wait_for_applied_everywhere(&cluster, &[0, 1, 2], 1).await);

    cluster.shutdown_node(old_leader).await;

    let new_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.expect("no new leader");
    assert_ne!(new_leader, old_leader);

    let response = submit_command(&client, &cluster.nodes[new_leader].api_addr, "SET b 2").await;
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let survivors: Vec<usize> = (0..3).filter(|&n| n != old_leader).collect();
    assert!(wait_for_applied_everywhere(&cluster, &survivors, 2).await);
    for &id in &survivors {
        assert_eq!(cluster.nodes[id].node.applied_commands(), vec!["SET a 1", "SET b 2"]);
    }

    cluster.shutdown().await;
}
