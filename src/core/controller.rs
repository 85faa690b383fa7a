//! RaftController - drives a RaftMachine with timers and a transport
//!
//! Each node runs four tasks: a consumer that applies events to the machine
//! one at a time, an election timer, a leader heartbeat timer and a receive
//! loop. Only the consumer mutates the machine; the other three just enqueue
//! events. All tasks stop when the controller's cancellation token fires.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::config::{ConfigError, RaftConfig};
use super::machine::{Control, RaftMachine, RaftState};
use super::message::{LogEntry, LogIndex, Message, NodeId, Term};
use crate::transport::Dispatcher;

/// Callback that receives newly committed entries, in index order
pub type Applicator = Box<dyn FnMut(Vec<LogEntry>) + Send>;

/// Errors returned to clients of a running controller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },
    /// The controller has been shut down
    #[error("controller stopped")]
    Stopped,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftState,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: usize,
    /// Leader for the current term, if known
    pub leader: Option<NodeId>,
}

/// Work item for the consumer task
#[derive(Debug)]
enum Event {
    Message(Message),
    ElectionTimeout,
    LeaderTimeout,
    AppendEntry(String),
}

/// State shared between the controller's tasks and its handles
struct Shared {
    id: NodeId,
    config: RaftConfig,
    machine: Mutex<RaftMachine>,
    dispatcher: Arc<dyn Dispatcher>,
    events: mpsc::UnboundedSender<Event>,
    election_deadline: Mutex<Instant>,
    leader_deadline: Mutex<Instant>,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Shared {
    fn send_message(&self, mut msg: Message) {
        msg.source = self.id;
        let (dest, kind) = (msg.dest, msg.kind_name());
        if let Err(e) = self.dispatcher.send_message(msg) {
            debug!(to = dest, kind, error = %e, "send failed");
        }
    }

    /// Move the election deadline forward, never backward
    fn reset_election_timer(&self) {
        let candidate = Instant::now() + self.config.random_election_timeout();
        let mut deadline = self.election_deadline.lock();
        if candidate > *deadline {
            *deadline = candidate;
        }
    }

    fn reset_leader_timeout(&self) {
        *self.leader_deadline.lock() = Instant::now() + self.config.heartbeat_interval;
    }

    fn enqueue(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// Apply one event to the machine and collect what it committed
    fn dispatch(&self, event: Event) -> Vec<LogEntry> {
        let mut machine = self.machine.lock();
        let mut effects = Effects { shared: self };
        match event {
            Event::Message(msg) => machine.handle_message(msg, &mut effects),
            Event::ElectionTimeout => machine.handle_election_timeout(&mut effects),
            Event::LeaderTimeout => machine.handle_leader_timeout(&mut effects),
            Event::AppendEntry(command) => {
                machine.append_new_entry(command);
            }
        }
        machine.take_committed()
    }

    fn status(&self) -> NodeStatus {
        let machine = self.machine.lock();
        NodeStatus {
            id: self.id,
            role: machine.state(),
            term: machine.current_term,
            voted_for: machine.voted_for,
            commit_index: machine.commit_index,
            last_applied: machine.last_applied,
            log_len: machine.log.len(),
            leader: machine.current_leader,
        }
    }
}

/// The machine's view of its controller
struct Effects<'a> {
    shared: &'a Shared,
}

impl Control for Effects<'_> {
    fn send_message(&mut self, msg: Message) {
        self.shared.send_message(msg);
    }

    fn reset_election_timer(&mut self) {
        self.shared.reset_election_timer();
    }

    fn reset_leader_timeout(&mut self) {
        self.shared.reset_leader_timeout();
    }
}

/// A node that has been configured but not started
pub struct RaftController {
    shared: Arc<Shared>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    paused_rx: watch::Receiver<bool>,
    applicator: Applicator,
}

impl RaftController {
    /// Create a controller for node `id`. Nothing runs until [`start`](Self::start).
    pub fn new<D>(
        id: NodeId,
        config: RaftConfig,
        dispatcher: Arc<D>,
        applicator: Applicator,
    ) -> Result<Self, ConfigError>
    where
        D: Dispatcher + 'static,
    {
        config.validate_node(id)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (paused, paused_rx) = watch::channel(false);
        let now = Instant::now();
        let shared = Arc::new(Shared {
            id,
            machine: Mutex::new(RaftMachine::new(id, &config)),
            dispatcher,
            events,
            election_deadline: Mutex::new(now + config.random_election_timeout()),
            leader_deadline: Mutex::new(now + config.heartbeat_interval),
            paused,
            shutdown: CancellationToken::new(),
            config,
        });
        Ok(Self {
            shared,
            events_rx,
            paused_rx,
            applicator,
        })
    }

    /// Spawn the consumer, both timers and the receive loop
    pub fn start(self) -> ControllerHandle {
        let Self {
            shared,
            events_rx,
            paused_rx,
            applicator,
        } = self;
        let id = shared.id;

        // Timers count from start, not from construction
        shared.reset_election_timer();
        shared.reset_leader_timeout();

        let span = info_span!("node", id);
        let tasks = vec![
            tokio::spawn(
                run_consumer(shared.clone(), events_rx, paused_rx, applicator)
                    .instrument(span.clone()),
            ),
            tokio::spawn(run_election_timer(shared.clone()).instrument(span.clone())),
            tokio::spawn(run_leader_timer(shared.clone()).instrument(span.clone())),
            tokio::spawn(run_receiver(shared.clone()).instrument(span)),
        ];
        info!(node = id, cluster_size = shared.config.cluster_size, "controller started");

        ControllerHandle {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }
}

/// Handle for interacting with a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ControllerHandle {
    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status()
    }

    /// Enqueue a client command, processed in order with every other event.
    /// Does not check the role; a non-leader drops the entry.
    pub fn append_entry(&self, command: impl Into<String>) -> Result<(), RaftError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        if !self.shared.enqueue(Event::AppendEntry(command.into())) {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }

    /// Accept a client command only if this node currently leads
    pub fn submit(&self, command: impl Into<String>) -> Result<(), RaftError> {
        let status = self.status();
        if status.role != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: status.leader,
            });
        }
        self.append_entry(command)
    }

    /// Stop consuming events. Timers and the receive loop keep queueing.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        debug!(node = self.shared.id, "paused");
    }

    /// Drain queued events in order and continue
    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        debug!(node = self.shared.id, "resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Stamp `source` with this node's id and hand the message to the transport
    pub fn send_message(&self, msg: Message) {
        self.shared.send_message(msg);
    }

    pub fn reset_election_timer(&self) {
        self.shared.reset_election_timer();
    }

    pub fn reset_leader_timeout(&self) {
        self.shared.reset_leader_timeout();
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(node = self.shared.id, "controller stopped");
    }
}

async fn run_consumer(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut paused: watch::Receiver<bool>,
    mut applicator: Applicator,
) {
    loop {
        let event = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if *paused.borrow() {
            let resumed = tokio::select! {
                _ = shared.shutdown.cancelled() => false,
                res = paused.wait_for(|p| !*p) => res.is_ok(),
            };
            if !resumed {
                break;
            }
        }

        trace!(?event, "event");
        let committed = shared.dispatch(event);
        if !committed.is_empty() {
            debug!(count = committed.len(), "applying committed entries");
            applicator(committed);
        }
    }
}

async fn run_election_timer(shared: Arc<Shared>) {
    loop {
        let deadline = *shared.election_deadline.lock();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }

        let now = Instant::now();
        let fired = {
            let mut deadline = shared.election_deadline.lock();
            if now >= *deadline {
                *deadline = now + shared.config.random_election_timeout();
                true
            } else {
                false
            }
        };
        if fired && !shared.enqueue(Event::ElectionTimeout) {
            break;
        }
    }
}

async fn run_leader_timer(shared: Arc<Shared>) {
    loop {
        let deadline = *shared.leader_deadline.lock();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }

        let now = Instant::now();
        let fired = {
            let mut deadline = shared.leader_deadline.lock();
            if now >= *deadline {
                *deadline = now + shared.config.heartbeat_interval;
                true
            } else {
                false
            }
        };
        if fired && !shared.enqueue(Event::LeaderTimeout) {
            break;
        }
    }
}

async fn run_receiver(shared: Arc<Shared>) {
    loop {
        let received = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            received = shared.dispatcher.recv_message(shared.id) => received,
        };
        match received {
            Ok(msg) => {
                if !shared.enqueue(Event::Message(msg)) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "receive loop stopped");
                break;
            }
        }
    }
}
