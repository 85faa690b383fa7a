//! Raft consensus engine
//!
//! A per-node Raft state machine driven by an async controller, with
//! in-process and TCP message transports and an HTTP client API.

pub mod api;
pub mod core;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
