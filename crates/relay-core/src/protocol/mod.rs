//! Protocol module containing the inbound request parser and outbound message types.

pub mod messages;
pub mod request;

pub use messages::{Notification, ServerReply, NOTIFICATION_KIND};
pub use request::{Action, ClientRequest, ModuleList, ProtocolError};
