//! Raft RPC messages
//!
//! Every message carries `(source, dest, term)` plus one of four kind-specific
//! payloads. Messages are plain values: the machine builds them, the
//! controller stamps `source`, and a dispatcher moves them between nodes.

use serde::{Deserialize, Serialize};

/// Node identity: an index in `[0, cluster_size)`
pub type NodeId = usize;

/// Election term
pub type Term = u64;

/// Position in the log. Index 0 is the first entry, -1 means "before the first entry".
pub type LogIndex = i64;

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the leader received the command
    pub term: Term,
    /// Opaque command for the application
    pub command: String,
}

impl LogEntry {
    pub fn new(term: Term, command: impl Into<String>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry (None for an empty log)
    pub last_log_term: Option<Term>,
}

/// RequestVote RPC result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (empty `entries` is a heartbeat)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index` (None when it is -1)
    pub prev_log_term: Option<Term>,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub success: bool,
    /// Highest index known to match the leader's log (-1 on failure)
    pub match_index: LogIndex,
}

/// Kind-specific payload, tagged on the wire by kind name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

/// A Raft message addressed from one node to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender, stamped by the sending controller
    pub source: NodeId,
    pub dest: NodeId,
    pub term: Term,
    pub kind: MessageKind,
}

impl Message {
    /// Build a message for `dest`. The source is left for the sending controller to stamp.
    pub fn new(dest: NodeId, term: Term, kind: MessageKind) -> Self {
        Self {
            source: 0,
            dest,
            term,
            kind,
        }
    }

    pub fn request_vote(
        dest: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Option<Term>,
    ) -> Self {
        Self::new(
            dest,
            term,
            MessageKind::RequestVote(RequestVote {
                last_log_index,
                last_log_term,
            }),
        )
    }

    pub fn request_vote_response(dest: NodeId, term: Term, vote_granted: bool) -> Self {
        Self::new(
            dest,
            term,
            MessageKind::RequestVoteResponse(RequestVoteResponse { vote_granted }),
        )
    }

    pub fn append_entries(
        dest: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Option<Term>,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self::new(
            dest,
            term,
            MessageKind::AppendEntries(AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            }),
        )
    }

    pub fn append_entries_response(
        dest: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
    ) -> Self {
        Self::new(
            dest,
            term,
            MessageKind::AppendEntriesResponse(AppendEntriesResponse {
                success,
                match_index,
            }),
        )
    }

    /// True for the two reply kinds
    pub fn is_response(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::RequestVoteResponse(_) | MessageKind::AppendEntriesResponse(_)
        )
    }

    /// Short kind name for logging
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::RequestVote(_) => "RequestVote",
            MessageKind::RequestVoteResponse(_) => "RequestVoteResponse",
            MessageKind::AppendEntries(_) => "AppendEntries",
            MessageKind::AppendEntriesResponse(_) => "AppendEntriesResponse",
        }
    }
}
