//! Domain types: connection identity and subscription state.
//!
//! Nothing in here performs I/O or blocks.

pub mod client_id;
pub mod subscriptions;

pub use client_id::{ClientId, ClientIdAllocator};
pub use subscriptions::SubscriptionSet;
