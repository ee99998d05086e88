//! Domain layer for relay-ws.
//!
//! Plain configuration types with no dependency on I/O, tokio, or the
//! websocket library.

pub mod config;

pub use config::{AuthMethod, BusConfig, RelayConfig};
