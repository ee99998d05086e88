//! # relay-core
//!
//! Shared library for relay-ws containing the client control protocol, the
//! notification type carried from the bus to websocket clients, and the
//! subscription bookkeeping used by every connection.
//!
//! This crate has zero dependencies on sockets, async runtimes, or threads.
//!
//! # Architecture overview
//!
//! relay-ws forwards notifications emitted by upstream controllers (over a
//! local bus) to websocket clients.  Each client chooses which *modules* it is
//! interested in by sending small JSON control frames.
//!
//! - **`protocol`** – What travels over the websocket.  Inbound control frames
//!   are parsed into a typed [`ClientRequest`]; outbound frames are either a
//!   [`ServerReply`] or a [`Notification`].
//!
//! - **`domain`** – Identity and state with no I/O: the [`ClientId`] issued to
//!   every connection and the [`SubscriptionSet`] it maintains.

pub mod domain;
pub mod protocol;

pub use domain::client_id::{ClientId, ClientIdAllocator};
pub use domain::subscriptions::SubscriptionSet;
pub use protocol::messages::{Notification, ServerReply, NOTIFICATION_KIND};
pub use protocol::request::{Action, ClientRequest, ModuleList, ProtocolError};
