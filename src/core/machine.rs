//! Raft consensus state machine
//!
//! Pure protocol logic: elections, vote granting, log replication and
//! commit-index computation. The machine never touches timers or sockets
//! itself; every side effect is requested through a [`Control`] passed into
//! each entry point, so the same machine runs under the async controller and
//! under a recording double in tests.
//!
//! Protocol from "In Search of an Understandable Consensus Algorithm"
//! (Ongaro & Ousterhout), with 0-based log indices.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::message::{
    AppendEntries, AppendEntriesResponse, LogEntry, LogIndex, Message, MessageKind, NodeId,
    RequestVote, RequestVoteResponse, Term,
};

/// Side effects the machine asks its controller to perform
pub trait Control {
    /// Deliver a message to `msg.dest`
    fn send_message(&mut self, msg: Message);
    /// Push the election deadline forward
    fn reset_election_timer(&mut self);
    /// Re-arm the leader heartbeat timer
    fn reset_leader_timeout(&mut self);
}

/// Raft node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Passive, receives updates from a leader
    Follower,
    /// Seeking votes to become leader
    Candidate,
    /// Replicates its log to every peer
    Leader,
}

/// Role plus the volatile state that only exists while holding it
#[derive(Debug, Clone)]
enum Role {
    Follower,
    Candidate {
        /// Voters that granted us their vote this term, self included
        votes: HashSet<NodeId>,
    },
    Leader {
        /// For each peer, index of the next log entry to send
        next_index: HashMap<NodeId, LogIndex>,
        /// For each peer, highest index known to be replicated there
        match_index: HashMap<NodeId, LogIndex>,
    },
}

/// Per-node Raft state machine
pub struct RaftMachine {
    /// This node's id
    pub id: NodeId,
    cluster_size: usize,
    /// Votes needed to win an election, self included
    quorum: usize,
    check_candidate_log: bool,

    // Persistent state (held in memory only)
    /// Latest term this node has seen
    pub current_term: Term,
    /// Candidate that received our vote in `current_term`
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,

    // Volatile state
    /// Highest log index known to be committed
    pub commit_index: LogIndex,
    /// Highest log index handed to the applicator
    pub last_applied: LogIndex,
    /// Source of the last AppendEntries accepted in the current term
    pub current_leader: Option<NodeId>,

    role: Role,
}

impl RaftMachine {
    /// Create a follower at term 0 with an empty log
    pub fn new(id: NodeId, config: &RaftConfig) -> Self {
        Self {
            id,
            cluster_size: config.cluster_size,
            quorum: config.quorum(),
            check_candidate_log: config.check_candidate_log,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            current_leader: None,
            role: Role::Follower,
        }
    }

    pub fn state(&self) -> RaftState {
        match self.role {
            Role::Follower => RaftState::Follower,
            Role::Candidate { .. } => RaftState::Candidate,
            Role::Leader { .. } => RaftState::Leader,
        }
    }

    /// Votes collected in the running election, or None when not a candidate
    pub fn votes_granted(&self) -> Option<usize> {
        match &self.role {
            Role::Candidate { votes } => Some(votes.len()),
            _ => None,
        }
    }

    /// Leader's `nextIndex` for `peer`
    pub fn next_index(&self, peer: NodeId) -> Option<LogIndex> {
        match &self.role {
            Role::Leader { next_index, .. } => next_index.get(&peer).copied(),
            _ => None,
        }
    }

    /// Leader's `matchIndex` for `peer`
    pub fn match_index(&self, peer: NodeId) -> Option<LogIndex> {
        match &self.role {
            Role::Leader { match_index, .. } => match_index.get(&peer).copied(),
            _ => None,
        }
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.len() as LogIndex - 1
    }

    pub fn last_log_term(&self) -> Option<Term> {
        self.log.last().map(|e| e.term)
    }

    fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.cluster_size).filter(move |&n| n != self.id)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index < 0 {
            return None;
        }
        self.log.get(index as usize).map(|e| e.term)
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_term: Option<Term>, last_log_index: LogIndex) -> bool {
        let mine = self.last_log_term();
        last_log_term > mine || (last_log_term == mine && last_log_index >= self.last_log_index())
    }

    // === Entry points ===

    /// Handle any incoming RPC
    pub fn handle_message(&mut self, msg: Message, ctl: &mut dyn Control) {
        if msg.term > self.current_term {
            self.adopt_term(msg.term);
        } else if msg.term < self.current_term && msg.is_response() {
            debug!(
                kind = msg.kind_name(),
                from = msg.source,
                msg_term = msg.term,
                term = self.current_term,
                "dropping stale response"
            );
            return;
        }

        let Message {
            source, term, kind, ..
        } = msg;

        match (self.state(), kind) {
            (_, MessageKind::RequestVote(args)) => {
                self.handle_request_vote(source, term, args, ctl)
            }
            (RaftState::Follower, MessageKind::AppendEntries(args)) => {
                self.handle_append_entries(source, term, args, ctl)
            }
            (RaftState::Candidate, MessageKind::AppendEntries(args)) => {
                if term == self.current_term {
                    // Someone else won this term's election
                    info!(term = self.current_term, leader = source, "candidate stepping down");
                    self.role = Role::Follower;
                }
                self.handle_append_entries(source, term, args, ctl)
            }
            (RaftState::Leader, MessageKind::AppendEntries(args)) if term < self.current_term => {
                self.handle_append_entries(source, term, args, ctl)
            }
            (RaftState::Candidate, MessageKind::RequestVoteResponse(result)) => {
                self.handle_request_vote_response(source, result, ctl)
            }
            (RaftState::Leader, MessageKind::AppendEntriesResponse(result)) => {
                self.handle_append_entries_response(source, result, ctl)
            }
            (state, kind) => self.ignore(state, source, term, &kind),
        }
    }

    /// Election timer fired
    pub fn handle_election_timeout(&mut self, ctl: &mut dyn Control) {
        match self.state() {
            RaftState::Follower | RaftState::Candidate => self.start_election(ctl),
            RaftState::Leader => debug!(term = self.current_term, "election timeout ignored by leader"),
        }
    }

    /// Leader heartbeat timer fired
    pub fn handle_leader_timeout(&mut self, ctl: &mut dyn Control) {
        if self.state() != RaftState::Leader {
            debug!(state = ?self.state(), "leader timeout ignored");
            return;
        }
        self.broadcast_append_entries(ctl);
        ctl.reset_leader_timeout();
    }

    /// Append a client command to the leader's log.
    /// Replication happens on the next heartbeat. Returns the new entry's index,
    /// or None when this node is not the leader.
    pub fn append_new_entry(&mut self, command: String) -> Option<LogIndex> {
        if self.state() != RaftState::Leader {
            warn!(state = ?self.state(), "dropping client entry on non-leader");
            return None;
        }
        self.log.push(LogEntry {
            term: self.current_term,
            command,
        });
        let index = self.last_log_index();
        debug!(index, term = self.current_term, "appended client entry");
        Some(index)
    }

    /// Entries committed since the last call, in index order.
    /// Advances `last_applied` so each entry is returned exactly once.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }
        let from = (self.last_applied + 1) as usize;
        let to = (self.commit_index + 1) as usize;
        let entries = self.log[from..to].to_vec();
        self.last_applied = self.commit_index;
        entries
    }

    // === Transitions ===

    fn adopt_term(&mut self, term: Term) {
        let old_state = self.state();
        self.current_term = term;
        self.voted_for = None;
        self.current_leader = None;
        self.role = Role::Follower;
        if old_state != RaftState::Follower {
            info!(was = ?old_state, term, "stepped down to follower");
        }
    }

    fn start_election(&mut self, ctl: &mut dyn Control) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.role = Role::Candidate {
            votes: HashSet::from([self.id]),
        };
        info!(term = self.current_term, "became candidate");
        ctl.reset_election_timer();

        let last_log_index = self.last_log_index();
        let last_log_term = self.last_log_term();
        for peer in self.peers() {
            ctl.send_message(Message::request_vote(
                peer,
                self.current_term,
                last_log_index,
                last_log_term,
            ));
        }
    }

    fn become_leader(&mut self, ctl: &mut dyn Control) {
        let next = self.log.len() as LogIndex;
        self.role = Role::Leader {
            next_index: self.peers().map(|p| (p, next)).collect(),
            match_index: self.peers().map(|p| (p, -1)).collect(),
        };
        self.current_leader = Some(self.id);
        info!(term = self.current_term, "became leader");
        self.broadcast_append_entries(ctl);
        ctl.reset_leader_timeout();
    }

    // === RPC handlers ===

    fn handle_request_vote(
        &mut self,
        candidate: NodeId,
        term: Term,
        args: RequestVote,
        ctl: &mut dyn Control,
    ) {
        // Without `check_candidate_log` the voter does not compare logs, so a
        // candidate missing committed entries can still win and later truncate
        // them on its followers; `splice_entries` then pulls `commit_index` and
        // `last_applied` back to the cut. Known gap.
        let granted = term >= self.current_term
            && self.voted_for.map_or(true, |v| v == candidate)
            && (!self.check_candidate_log
                || self.is_log_up_to_date(args.last_log_term, args.last_log_index));

        if granted {
            self.voted_for = Some(candidate);
            ctl.reset_election_timer();
        }
        debug!(candidate, term = self.current_term, granted, "vote request");
        ctl.send_message(Message::request_vote_response(
            candidate,
            self.current_term,
            granted,
        ));
    }

    fn handle_append_entries(
        &mut self,
        leader: NodeId,
        term: Term,
        args: AppendEntries,
        ctl: &mut dyn Control,
    ) {
        if term < self.current_term {
            ctl.send_message(Message::append_entries_response(
                leader,
                self.current_term,
                false,
                -1,
            ));
            return;
        }

        // Valid leader for this term
        self.current_leader = Some(leader);
        ctl.reset_election_timer();

        let log_ok = args.prev_log_index == -1
            || (args.prev_log_index >= 0
                && args.prev_log_term.is_some()
                && self.term_at(args.prev_log_index) == args.prev_log_term);

        if !log_ok {
            debug!(
                prev_log_index = args.prev_log_index,
                log_len = self.log.len(),
                "log mismatch"
            );
            ctl.send_message(Message::append_entries_response(
                leader,
                self.current_term,
                false,
                -1,
            ));
            return;
        }

        let match_index = args.prev_log_index + args.entries.len() as LogIndex;
        self.splice_entries(args.prev_log_index, args.entries);

        // If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let new_commit = args.leader_commit.min(match_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            debug!(commit_index = self.commit_index, "follower commit advanced");
        }

        ctl.send_message(Message::append_entries_response(
            leader,
            self.current_term,
            true,
            match_index,
        ));
    }

    /// Write `entries` after `prev_log_index`, truncating only from the first conflict
    fn splice_entries(&mut self, prev_log_index: LogIndex, entries: Vec<LogEntry>) {
        let start = (prev_log_index + 1) as usize;
        for (offset, entry) in entries.into_iter().enumerate() {
            let pos = start + offset;
            match self.log.get(pos) {
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    let cut = pos as LogIndex - 1;
                    if cut < self.commit_index {
                        warn!(pos, commit_index = self.commit_index, "overwriting committed entry");
                        self.commit_index = cut;
                        self.last_applied = self.last_applied.min(cut);
                    }
                    self.log.truncate(pos);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }
    }

    fn handle_request_vote_response(
        &mut self,
        voter: NodeId,
        result: RequestVoteResponse,
        ctl: &mut dyn Control,
    ) {
        let quorum = self.quorum;
        let quorum_reached = match &mut self.role {
            Role::Candidate { votes } => {
                if result.vote_granted {
                    votes.insert(voter);
                }
                votes.len() >= quorum
            }
            _ => false,
        };
        debug!(voter, granted = result.vote_granted, "vote response");
        if quorum_reached {
            self.become_leader(ctl);
        }
    }

    fn handle_append_entries_response(
        &mut self,
        peer: NodeId,
        result: AppendEntriesResponse,
        ctl: &mut dyn Control,
    ) {
        let Role::Leader {
            next_index,
            match_index,
        } = &mut self.role
        else {
            return;
        };

        if result.success {
            let matched = match_index.entry(peer).or_insert(-1);
            if result.match_index > *matched {
                *matched = result.match_index;
            }
            next_index.insert(peer, *matched + 1);
            self.advance_commit_index();
        } else {
            // Back up one entry and retry immediately
            let next = next_index.entry(peer).or_insert(0);
            *next = (*next - 1).max(0);
            debug!(peer, next_index = *next, "append rejected, backing up");
            if let Some(msg) = self.append_entries_for(peer) {
                ctl.send_message(msg);
            }
        }
    }

    /// Commit the median of the peers' match indices
    fn advance_commit_index(&mut self) {
        let Role::Leader { match_index, .. } = &self.role else {
            return;
        };
        let mut matched: Vec<LogIndex> = match_index.values().copied().collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable();
        let median = matched[matched.len() / 2].min(self.last_log_index());
        if median > self.commit_index {
            self.commit_index = median;
            debug!(commit_index = median, "leader commit advanced");
        }
    }

    // === Outbound helpers ===

    /// AppendEntries for `peer` as its `nextIndex` dictates
    fn append_entries_for(&self, peer: NodeId) -> Option<Message> {
        let next = self.next_index(peer)?;
        let next = next.clamp(0, self.log.len() as LogIndex);
        let prev_log_index = next - 1;
        Some(Message::append_entries(
            peer,
            self.current_term,
            prev_log_index,
            self.term_at(prev_log_index),
            self.log[next as usize..].to_vec(),
            self.commit_index,
        ))
    }

    fn broadcast_append_entries(&self, ctl: &mut dyn Control) {
        for peer in self.peers() {
            if let Some(msg) = self.append_entries_for(peer) {
                ctl.send_message(msg);
            }
        }
    }

    fn ignore(&self, state: RaftState, source: NodeId, term: Term, kind: &MessageKind) {
        match kind {
            MessageKind::AppendEntries(_) => warn!(
                ?state,
                from = source,
                term,
                "AppendEntries from another leader in our term"
            ),
            _ => debug!(?state, from = source, term, ?kind, "message ignored"),
        }
    }
}
