//! Infrastructure layer for relay-ws.
//!
//! Everything that performs I/O lives here:
//!
//! - accepting TCP connections and upgrading them to websockets
//! - authenticating the upgrade request before any state exists
//! - reading notifications from the upstream bus on a dedicated thread
//!
//! Protocol parsing and subscription state are not here; see
//! `relay-core` and the application layer.

pub mod auth;
pub mod bus;
pub mod handshake;
pub mod ws_server;

pub use bus::{BusBridge, BusBridgeHandle};
pub use ws_server::{bind, serve};
