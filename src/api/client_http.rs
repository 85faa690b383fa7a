//! HTTP client API for a Raft node
//!
//! Provides HTTP endpoints for external clients to interact with one node:
//! - Submit commands (accepted only by the leader)
//! - Query node status and leader information

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::controller::{ControllerHandle, NodeStatus, RaftError};
use crate::core::machine::RaftState;
use crate::core::message::NodeId;

/// Request body for submitting a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// The command to submit (e.g., "SET key value")
    pub command: String,
}

/// Response from an accepted submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Leader that queued the entry
    pub node_id: NodeId,
    /// Term the entry will be appended in
    pub term: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<NodeId>,
}

/// Response for leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    /// Current leader ID if known
    pub leader_id: Option<NodeId>,
    /// This node's ID
    pub node_id: NodeId,
    /// Whether this node is the leader
    pub is_leader: bool,
}

/// Create an axum router for the client HTTP API of one node
pub fn create_client_router(handle: ControllerHandle) -> Router {
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .with_state(handle)
}

/// Handle POST /client/submit - queue a command on the leader.
/// Replication and commit happen asynchronously; 202 means "appended", not "committed".
pub async fn handle_submit(
    State(handle): State<ControllerHandle>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ErrorResponse>)> {
    let term = handle.status().term;
    match handle.submit(request.command) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                node_id: handle.id(),
                term,
            }),
        )),
        Err(RaftError::NotLeader { leader_hint }) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Not the leader".to_string(),
                leader_hint,
            }),
        )),
        Err(RaftError::Stopped) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Node is shutting down".to_string(),
                leader_hint: None,
            }),
        )),
    }
}

/// Handle GET /client/leader - get current leader information
pub async fn handle_leader(State(handle): State<ControllerHandle>) -> Json<LeaderResponse> {
    let status = handle.status();
    Json(LeaderResponse {
        leader_id: status.leader,
        node_id: status.id,
        is_leader: status.role == RaftState::Leader,
    })
}

/// Handle GET /client/status - get node status
pub async fn handle_status(State(handle): State<ControllerHandle>) -> Json<NodeStatus> {
    Json(handle.status())
}
