//! Consensus core: configuration, messages, the state machine and its controller

pub mod config;
pub mod controller;
pub mod machine;
pub mod message;

pub use config::{ConfigError, RaftConfig};
pub use controller::{Applicator, ControllerHandle, NodeStatus, RaftController, RaftError};
pub use machine::{Control, RaftMachine, RaftState};
pub use message::{LogEntry, LogIndex, Message, MessageKind, NodeId, Term};
