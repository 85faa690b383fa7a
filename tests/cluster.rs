//! In-process cluster integration tests
//!
//! Full clusters of controllers over the queue transport, with real timers
//! at test speed. Partitions are simulated by isolating nodes.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use raftline::core::controller::RaftError;
use raftline::core::machine::RaftState;
use raftline::testing::{fast_config, TestCluster};

const LEADER_TIMEOUT: Duration = Duration::from_secs(5);
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_cluster_elects_leader() {
    let cluster = TestCluster::new();

    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    assert!(leader.is_some(), "no leader elected");

    // Give heartbeats time to reach everyone
    tokio::time::sleep(Duration::from_millis(200)).await;
    let leader = leader.unwrap();
    let term = cluster.node(leader).handle.status().term;
    for node in &cluster.nodes {
        let status = node.handle.status();
        assert_eq!(status.term, term);
        if node.id != leader {
            assert_eq!(status.role, RaftState::Follower);
            assert_eq!(status.leader, Some(leader));
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_leader_per_term() {
    let cluster = TestCluster::with_nodes(5);
    let mut seen: HashMap<u64, HashSet<usize>> = HashMap::new();

    for _ in 0..100 {
        for (id, term) in cluster.leaders() {
            seen.entry(term).or_default().insert(id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!seen.is_empty(), "no leader observed");
    for (term, leaders) in &seen {
        assert_eq!(leaders.len(), 1, "term {} had leaders {:?}", term, leaders);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replicates_commands_in_order() {
    let cluster = TestCluster::with_nodes(5);
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    let commands = ["SET a 1", "SET b 2", "DELETE a", "SET c 3"];
    for command in commands {
        cluster.submit(leader, command).unwrap();
    }

    for node in &cluster.nodes {
        assert!(
            cluster
                .wait_for_applied(node.id, commands.len(), APPLY_TIMEOUT)
                .await,
            "node {} did not apply all commands",
            node.id
        );
        assert_eq!(cluster.applied(node.id), commands);
    }

    let status = cluster.node(leader).handle.status();
    assert_eq!(status.commit_index, commands.len() as i64 - 1);
    assert_eq!(status.last_applied, status.commit_index);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_submit_with_hint() {
    let cluster = TestCluster::new();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let follower = (leader + 1) % cluster.nodes.len();
    assert_eq!(
        cluster.submit(follower, "SET x 1"),
        Err(RaftError::NotLeader {
            leader_hint: Some(leader)
        })
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_failover() {
    let cluster = TestCluster::new();
    let old_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    let old_term = cluster.node(old_leader).handle.status().term;

    cluster.submit(old_leader, "SET before 1").unwrap();
    for node in &cluster.nodes {
        assert!(cluster.wait_for_applied(node.id, 1, APPLY_TIMEOUT).await);
    }

    cluster.isolate(old_leader);
    let new_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    assert_ne!(new_leader, old_leader);
    assert!(cluster.node(new_leader).handle.status().term > old_term);

    cluster.submit(new_leader, "SET after 2").unwrap();
    assert!(cluster.wait_for_applied(new_leader, 2, APPLY_TIMEOUT).await);

    // Isolated leader cannot commit anything on its own
    assert_eq!(cluster.applied(old_leader), vec!["SET before 1"]);

    // After healing, the old leader steps down and catches up
    cluster.heal(old_leader);
    assert!(cluster.wait_for_applied(old_leader, 2, APPLY_TIMEOUT).await);
    assert_eq!(cluster.applied(old_leader), vec!["SET before 1", "SET after 2"]);
    assert_eq!(
        cluster.node(old_leader).handle.status().role,
        RaftState::Follower
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_minority_partition_cannot_elect() {
    let cluster = TestCluster::new();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    // Cut off both followers: the leader keeps its role but commits nothing
    let followers: Vec<usize> = (0..3).filter(|&n| n != leader).collect();
    for &f in &followers {
        cluster.isolate(f);
    }
    cluster.submit(leader, "SET lost 1").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(cluster.applied(leader).is_empty());
    for &f in &followers {
        // Isolated followers time out but never gather a majority
        let status = cluster.node(f).handle.status();
        assert_ne!(status.role, RaftState::Leader);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_strict_votes_cluster_replicates() {
    let cluster = TestCluster::with_config(fast_config(3).with_candidate_log_check(true));
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    cluster.submit(leader, "SET k v").unwrap();
    for node in &cluster.nodes {
        assert!(cluster.wait_for_applied(node.id, 1, APPLY_TIMEOUT).await);
    }

    cluster.shutdown().await;
}
