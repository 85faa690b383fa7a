//! Transport layer for Raft messages
//!
//! - `QueueDispatcher`: in-process queues for simulation and tests
//! - `TcpDispatcher`: length-prefixed JSON frames over persistent TCP connections

pub mod framing;
pub mod inmemory;
pub mod tcp;
pub mod traits;

pub use traits::{Dispatcher, TransportError};
