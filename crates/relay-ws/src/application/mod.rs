//! Application layer for relay-ws.
//!
//! Holds the live connection state and the fan-out logic.  Everything here
//! is synchronous and runtime-agnostic: it is driven from tokio tasks on one
//! side and from the bus thread on the other.

pub mod connection;
pub mod registry;

pub use connection::{Connection, Outbox, SendError};
pub use registry::ConnectionRegistry;
