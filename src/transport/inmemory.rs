//! In-memory transport: one unbounded queue per node
//!
//! Used for single-process clusters and deterministic tests. Nodes can be
//! isolated to simulate a partition; messages to or from an isolated node
//! are silently dropped.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Dispatcher, TransportError};
use crate::core::message::{Message, NodeId};

/// Queue-per-node dispatcher shared by every controller in the process
pub struct QueueDispatcher {
    senders: Vec<mpsc::UnboundedSender<Message>>,
    receivers: Vec<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    isolated: Mutex<HashSet<NodeId>>,
}

impl QueueDispatcher {
    /// Create queues for nodes `0..nodes`
    pub fn new(nodes: usize) -> Arc<Self> {
        let (senders, receivers) = (0..nodes)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, tokio::sync::Mutex::new(rx))
            })
            .unzip();
        Arc::new(Self {
            senders,
            receivers,
            isolated: Mutex::new(HashSet::new()),
        })
    }

    /// Drop all traffic to and from `node` until healed
    pub fn isolate(&self, node: NodeId) {
        self.isolated.lock().insert(node);
    }

    /// Restore traffic for `node`
    pub fn heal(&self, node: NodeId) {
        self.isolated.lock().remove(&node);
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.lock().contains(&node)
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        let sender = self
            .senders
            .get(msg.dest)
            .ok_or(TransportError::NodeNotFound(msg.dest))?;

        {
            let isolated = self.isolated.lock();
            if isolated.contains(&msg.source) || isolated.contains(&msg.dest) {
                trace!(from = msg.source, to = msg.dest, "dropped by partition");
                return Ok(());
            }
        }

        sender.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn recv_message(&self, node: NodeId) -> Result<Message, TransportError> {
        let receiver = self
            .receivers
            .get(node)
            .ok_or(TransportError::NodeNotFound(node))?;
        receiver.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}
