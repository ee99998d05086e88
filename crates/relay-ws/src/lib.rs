//! relay-ws library crate.
//!
//! Forwards notifications emitted by local controllers on a bus to the
//! websocket clients that subscribed to their module.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! controllers ──► bus (Unix socket / ubus)
//!                   │
//! [relay-ws]        ▼
//!   ├── domain/            RelayConfig, AuthMethod, BusConfig
//!   ├── application/       Connection, ConnectionRegistry (fan-out)
//!   └── infrastructure/
//!         ├── bus/         BusListener backends + the bridge thread
//!         ├── auth/        Authenticator backends
//!         ├── handshake    HTTP upgrade request peeking
//!         └── ws_server    accept loop and per-client tasks (tokio-tungstenite)
//!                   │
//!                   ▼
//!          browsers (JSON over WebSocket)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `relay-core`; it is synchronous so
//!   both the bus thread and the tokio runtime can drive it.
//! - `infrastructure` depends on all other layers plus `tokio` and `tungstenite`.
//!
//! # For beginners: two worlds, one registry
//!
//! Bus listeners are blocking APIs and run on their own OS thread.  Websocket
//! I/O is async and runs on tokio.  The only thing both sides touch is the
//! [`application::ConnectionRegistry`], and the only way the bus thread gets
//! bytes onto a socket is by dropping a string into a connection's channel.

/// Domain layer: configuration types (no I/O).
pub mod domain;

/// Application layer: connections, subscriptions and fan-out.
pub mod application;

/// Infrastructure layer: websocket server, authentication and bus backends.
pub mod infrastructure;
