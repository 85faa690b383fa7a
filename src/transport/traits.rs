//! Transport abstraction for moving Raft messages between nodes

use async_trait::async_trait;
use thiserror::Error;

use crate::core::message::{Message, NodeId};
use super::framing::FrameError;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Destination is not part of this transport
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    /// Transport has shut down
    #[error("transport closed")]
    Closed,
    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be read or decoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Message transport shared by the controllers of one process
///
/// Sending never blocks: messages are queued and delivery is best effort.
/// Raft's own retries (heartbeats, vote re-requests) mask any loss.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queue `msg` for delivery to `msg.dest`
    fn send_message(&self, msg: Message) -> Result<(), TransportError>;

    /// Wait for the next message addressed to `node`
    async fn recv_message(&self, node: NodeId) -> Result<Message, TransportError>;
}
