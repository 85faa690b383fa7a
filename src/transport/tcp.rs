//! TCP transport for multi-process clusters
//!
//! Every node listens on its own address. Outbound traffic goes through one
//! sender task per peer that owns a lazily opened connection; if the peer is
//! unreachable the message is dropped and the next one tries again.
//! Inbound connections are read frame by frame into a single queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::framing::Channel;
use super::{Dispatcher, TransportError};
use crate::core::message::{Message, NodeId};

/// Give up on a connection attempt after this long
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Dispatcher that moves messages over framed TCP connections
pub struct TcpDispatcher {
    id: NodeId,
    local_addr: SocketAddr,
    /// Per-peer outbound queues, `None` at our own index
    outbound: Vec<Option<mpsc::UnboundedSender<Message>>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpDispatcher {
    /// Bind `peers[id]` and start the transport for node `id`
    pub async fn bind(id: NodeId, peers: Vec<SocketAddr>) -> Result<Arc<Self>, TransportError> {
        let addr = *peers.get(id).ok_or(TransportError::NodeNotFound(id))?;
        let listener = TcpListener::bind(addr).await?;
        Self::with_listener(id, listener, peers)
    }

    /// Start the transport on an already bound listener.
    /// Must be called from within a Tokio runtime.
    pub fn with_listener(
        id: NodeId,
        listener: TcpListener,
        peers: Vec<SocketAddr>,
    ) -> Result<Arc<Self>, TransportError> {
        if id >= peers.len() {
            return Err(TransportError::NodeNotFound(id));
        }
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(peers.len());
        let mut outbound = Vec::with_capacity(peers.len());

        for (peer, addr) in peers.iter().copied().enumerate() {
            if peer == id {
                outbound.push(None);
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.push(Some(tx));
            tasks.push(tokio::spawn(
                run_peer_sender(peer, addr, rx, shutdown.clone())
                    .instrument(info_span!("node", id, peer)),
            ));
        }

        tasks.push(tokio::spawn(
            run_accept_loop(id, listener, inbound_tx.clone(), shutdown.clone())
                .instrument(info_span!("node", id)),
        ));

        info!(node = id, %local_addr, "tcp transport listening");

        Ok(Arc::new(Self {
            id,
            local_addr,
            outbound,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and sending, and wait for the transport tasks to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl Dispatcher for TcpDispatcher {
    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if msg.dest == self.id {
            return self.inbound_tx.send(msg).map_err(|_| TransportError::Closed);
        }
        match self.outbound.get(msg.dest) {
            Some(Some(tx)) => tx.send(msg).map_err(|_| TransportError::Closed),
            _ => Err(TransportError::NodeNotFound(msg.dest)),
        }
    }

    async fn recv_message(&self, node: NodeId) -> Result<Message, TransportError> {
        if node != self.id {
            return Err(TransportError::NodeNotFound(node));
        }
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

async fn run_peer_sender(
    peer: NodeId,
    addr: SocketAddr,
    mut queue: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    let mut channel: Option<Channel<TcpStream>> = None;

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if channel.is_none() {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(peer, %addr, "connected");
                    channel = Some(Channel::new(stream));
                }
                Ok(Err(e)) => {
                    trace!(peer, %addr, error = %e, "connect failed, dropping message");
                    continue;
                }
                Err(_) => {
                    trace!(peer, %addr, "connect timed out, dropping message");
                    continue;
                }
            }
        }

        if let Some(ch) = channel.as_mut() {
            if let Err(e) = ch.send_json(&msg).await {
                debug!(peer, error = %e, "send failed, closing connection");
                channel = None;
            }
        }
    }
}

async fn run_accept_loop(
    id: NodeId,
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        trace!(%remote, "accepted connection");
        tokio::spawn(
            run_connection(id, stream, inbound.clone(), shutdown.clone()).in_current_span(),
        );
    }
}

async fn run_connection(
    id: NodeId,
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
) {
    let mut channel = Channel::new(stream);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = channel.recv_json::<Message>() => frame,
        };
        match frame {
            Ok(Some(msg)) if msg.dest == id => {
                if inbound.send(msg).is_err() {
                    break;
                }
            }
            Ok(Some(msg)) => {
                warn!(dest = msg.dest, from = msg.source, "dropping misaddressed message");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "dropping connection");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (Arc<TcpDispatcher>, Arc<TcpDispatcher>) {
        let l0 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers = vec![l0.local_addr().unwrap(), l1.local_addr().unwrap()];
        let d0 = TcpDispatcher::with_listener(0, l0, peers.clone()).unwrap();
        let d1 = TcpDispatcher::with_listener(1, l1, peers).unwrap();
        (d0, d1)
    }

    #[tokio::test]
    async fn test_message_crosses_loopback() {
        let (d0, d1) = loopback_pair().await;

        let mut msg = Message::request_vote(1, 4, 2, Some(3));
        msg.source = 0;
        d0.send_message(msg.clone()).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), d1.recv_message(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);

        d0.shutdown().await;
        d1.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_self_short_circuits() {
        let (d0, d1) = loopback_pair().await;
        d0.send_message(Message::request_vote_response(0, 1, true))
            .unwrap();
        let got = d0.recv_message(0).await.unwrap();
        assert_eq!(got.dest, 0);

        d0.shutdown().await;
        d1.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_local_node_can_receive() {
        let (d0, d1) = loopback_pair().await;
        assert!(matches!(
            d0.recv_message(1).await,
            Err(TransportError::NodeNotFound(1))
        ));
        assert!(matches!(
            d0.send_message(Message::request_vote(5, 1, -1, None)),
            Err(TransportError::NodeNotFound(5))
        ));

        d0.shutdown().await;
        d1.shutdown().await;
    }

    #[tokio::test]
    async fn test_sender_reconnects_after_peer_restart() {
        let l0 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peers = vec![l0.local_addr().unwrap(), l1.local_addr().unwrap()];
        let d0 = TcpDispatcher::with_listener(0, l0, peers.clone()).unwrap();
        let d1 = TcpDispatcher::with_listener(1, l1, peers.clone()).unwrap();

        d0.send_message(Message::request_vote(1, 1, -1, None)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), d1.recv_message(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.term, 1);

        // Restart node 1 on the same address; d0 still holds the old connection
        d1.shutdown().await;
        drop(d1);
        let d1 = TcpDispatcher::bind(1, peers).await.unwrap();

        // Writes on the dead connection are lost until the sender reconnects
        let mut delivered = None;
        for term in 2..=50 {
            d0.send_message(Message::request_vote(1, term, -1, None)).unwrap();
            if let Ok(Ok(msg)) =
                tokio::time::timeout(Duration::from_millis(200), d1.recv_message(1)).await
            {
                delivered = Some(msg.term);
                break;
            }
        }
        let first = delivered.expect("no message arrived after restart");
        assert!(first >= 2);

        // Once reconnected, nothing further is lost
        d0.send_message(Message::request_vote(1, 100, -1, None)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = d1.recv_message(1).await.unwrap();
                if msg.term == 100 {
                    break msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got.source, 0);

        d0.shutdown().await;
        d1.shutdown().await;
    }

    #[tokio::test]
    async fn test_garbage_frame_drops_only_that_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (d0, d1) = loopback_pair().await;

        let mut raw = TcpStream::connect(d1.local_addr()).await.unwrap();
        raw.write_all(b"           5{bad}").await.unwrap();

        // The receiver hangs up on the bad connection
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap_or(0), 0);

        // Other connections keep working, old and new
        d0.send_message(Message::request_vote(1, 3, -1, None)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), d1.recv_message(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.term, 3);

        let mut fresh = Channel::new(TcpStream::connect(d1.local_addr()).await.unwrap());
        let mut msg = Message::append_entries_response(1, 4, true, 0);
        msg.source = 0;
        fresh.send_json(&msg).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), d1.recv_message(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);

        d0.shutdown().await;
        d1.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_drops_silently() {
        let l0 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // Reserve an address, then free it so nothing listens there
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = gone.local_addr().unwrap();
        drop(gone);

        let own_addr = l0.local_addr().unwrap();
        let d0 = TcpDispatcher::with_listener(0, l0, vec![own_addr, dead_addr]).unwrap();
        assert!(d0
            .send_message(Message::request_vote(1, 1, -1, None))
            .is_ok());
        d0.shutdown().await;

        assert!(matches!(
            d0.send_message(Message::request_vote(1, 1, -1, None)),
            Err(TransportError::Closed)
        ));
    }
}
