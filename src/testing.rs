//! Testing utilities for Raft cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process Raft clusters over the
//! queue transport, and `TcpTestCluster` for loopback clusters that speak
//! the framed TCP protocol and serve the client HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::api::client_http::create_client_router;
use crate::core::config::RaftConfig;
use crate::core::controller::{ControllerHandle, RaftController, RaftError};
use crate::core::machine::RaftState;
use crate::core::message::{LogEntry, NodeId, Term};
use crate::transport::inmemory::QueueDispatcher;
use crate::transport::tcp::TcpDispatcher;
use crate::transport::Dispatcher;

/// Entries delivered to one node's applicator, in delivery order
pub type AppliedLog = Arc<Mutex<Vec<LogEntry>>>;

/// Timing suited to tests: fast heartbeats, short randomized elections
pub fn fast_config(cluster_size: usize) -> RaftConfig {
    RaftConfig::default()
        .with_cluster_size(cluster_size)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(150))
}

/// A single test node in the cluster
pub struct TestNode {
    /// Node ID
    pub id: NodeId,
    /// Controller handle
    pub handle: ControllerHandle,
    /// Everything the applicator has received
    pub applied: AppliedLog,
}

impl TestNode {
    /// Commands applied so far
    pub fn applied_commands(&self) -> Vec<String> {
        self.applied.lock().iter().map(|e| e.command.clone()).collect()
    }
}

fn start_node<D: Dispatcher + 'static>(
    id: NodeId,
    config: &RaftConfig,
    dispatcher: Arc<D>,
) -> TestNode {
    let applied: AppliedLog = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();
    let controller = RaftController::new(
        id,
        config.clone(),
        dispatcher,
        Box::new(move |entries| sink.lock().extend(entries)),
    )
    .expect("invalid test cluster config");
    TestNode {
        id,
        handle: controller.start(),
        applied,
    }
}

/// Poll `nodes` until one of them is leader; the highest-term leader wins
async fn poll_for_leader<'a>(
    nodes: impl Iterator<Item = &'a TestNode> + Clone,
    timeout: Duration,
) -> Option<NodeId> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let leader = nodes
            .clone()
            .map(|n| n.handle.status())
            .filter(|s| s.role == RaftState::Leader)
            .max_by_key(|s| s.term);
        if let Some(status) = leader {
            return Some(status.id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// A test cluster of Raft nodes sharing one in-process dispatcher
pub struct TestCluster {
    /// All nodes in the cluster, indexed by node id
    pub nodes: Vec<TestNode>,
    /// Shared transport, exposed for partition control
    pub dispatcher: Arc<QueueDispatcher>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub fn new() -> Self {
        Self::with_nodes(3)
    }

    /// Create and start a cluster with the specified number of nodes
    pub fn with_nodes(count: usize) -> Self {
        Self::with_config(fast_config(count))
    }

    /// Create and start a cluster described by `config`
    pub fn with_config(config: RaftConfig) -> Self {
        let dispatcher = QueueDispatcher::new(config.cluster_size);
        let nodes = (0..config.cluster_size)
            .map(|id| start_node(id, &config, dispatcher.clone()))
            .collect();
        TestCluster { nodes, dispatcher }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[id]
    }

    /// Wait for a reachable node to become leader, with timeout
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let dispatcher = &self.dispatcher;
        poll_for_leader(
            self.nodes.iter().filter(|n| !dispatcher.is_isolated(n.id)),
            timeout,
        )
        .await
    }

    /// Every (node, term) pair currently claiming leadership
    pub fn leaders(&self) -> Vec<(NodeId, Term)> {
        self.nodes
            .iter()
            .map(|n| n.handle.status())
            .filter(|s| s.role == RaftState::Leader)
            .map(|s| (s.id, s.term))
            .collect()
    }

    /// Submit a command to node `id`
    pub fn submit(&self, id: NodeId, command: &str) -> Result<(), RaftError> {
        self.nodes[id].handle.submit(command)
    }

    /// Commands applied on node `id`
    pub fn applied(&self, id: NodeId) -> Vec<String> {
        self.nodes[id].applied_commands()
    }

    /// Wait until node `id` has applied at least `count` entries
    pub async fn wait_for_applied(&self, id: NodeId, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.nodes[id].applied.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Cut node `id` off from the rest of the cluster
    pub fn isolate(&self, id: NodeId) {
        self.dispatcher.isolate(id);
    }

    /// Reconnect node `id`
    pub fn heal(&self, id: NodeId) {
        self.dispatcher.heal(id);
    }

    /// Shutdown all nodes gracefully
    pub async fn shutdown(self) {
        join_all(self.nodes.iter().map(|n| n.handle.shutdown())).await;
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of a loopback TCP cluster
pub struct TcpTestNode {
    pub node: TestNode,
    /// Raft transport address
    pub raft_addr: SocketAddr,
    /// Client HTTP API address
    pub api_addr: SocketAddr,
    dispatcher: Arc<TcpDispatcher>,
    /// HTTP server shutdown channel
    http_shutdown_tx: Option<oneshot::Sender<()>>,
}

/// A test cluster whose nodes talk over loopback TCP and each serve the client API
pub struct TcpTestCluster {
    pub nodes: Vec<TcpTestNode>,
}

impl TcpTestCluster {
    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_config(fast_config(count)).await
    }

    /// Create and start a cluster described by `config`
    pub async fn with_config(config: RaftConfig) -> Self {
        // First, bind all listeners to get addresses
        let mut raft_listeners = Vec::new();
        let mut raft_addrs = Vec::new();
        for _ in 0..config.cluster_size {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            raft_addrs.push(listener.local_addr().unwrap());
            raft_listeners.push(listener);
        }

        let mut nodes = Vec::new();
        for (id, listener) in raft_listeners.into_iter().enumerate() {
            let dispatcher = TcpDispatcher::with_listener(id, listener, raft_addrs.clone())
                .expect("failed to start tcp transport");
            let node = start_node(id, &config, dispatcher.clone());

            let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let api_addr = api_listener.local_addr().unwrap();
            let app = create_client_router(node.handle.clone());

            // Spawn the HTTP server with graceful shutdown
            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                let _ = axum::serve(api_listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await;
            });

            nodes.push(TcpTestNode {
                node,
                raft_addr: raft_addrs[id],
                api_addr,
                dispatcher,
                http_shutdown_tx: Some(http_shutdown_tx),
            });
        }

        TcpTestCluster { nodes }
    }

    /// Wait for a running node to become leader, with timeout
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        poll_for_leader(
            self.nodes
                .iter()
                .filter(|n| n.http_shutdown_tx.is_some())
                .map(|n| &n.node),
            timeout,
        )
        .await
    }

    /// Get all client API addresses
    pub fn api_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.api_addr).collect()
    }

    /// Stop one node's controller, transport and HTTP server
    pub async fn shutdown_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        if let Some(tx) = node.http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        node.node.handle.shutdown().await;
        node.dispatcher.shutdown().await;
    }

    /// Shutdown all nodes gracefully
    pub async fn shutdown(mut self) {
        for id in 0..self.nodes.len() {
            self.shutdown_node(id).await;
        }
    }
}
