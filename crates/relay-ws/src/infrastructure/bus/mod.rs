//! Upstream bus backends.
//!
//! A [`BusListener`] turns some blocking source of controller events into
//! calls of a single callback, `on_notification(controller_id, notification)`.
//! The [`BusBridge`] runs one listener on a dedicated OS thread and feeds the
//! callback into [`ConnectionRegistry::publish`](crate::application::ConnectionRegistry::publish).
//!
//! # Backends
//!
//! | Sub-command | Type | Source |
//! |---|---|---|
//! | `unix-socket` | [`UnixSocketListener`] | length-prefixed JSON frames on a Unix stream socket |
//! | `ubus` | [`UbusListener`] | `ubus listen` output, one JSON object per line |
//! | (tests) | [`ChannelListener`] | an in-memory channel |
//!
//! # For beginners: why a thread and not a task?
//!
//! `listen()` blocks for as long as the bus is up.  Blocking inside a tokio
//! task would stall one of the runtime's worker threads, so the bridge gets an
//! OS thread of its own and talks to the runtime only through the registry.

pub mod bridge;
pub mod mock;
pub mod node_id;
pub mod ubus;
#[cfg(unix)]
pub mod unix_socket;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use relay_core::Notification;
use thiserror::Error;

use crate::domain::config::BusConfig;

pub use bridge::{BusBridge, BusBridgeHandle};
pub use mock::{ChannelInjector, ChannelListener};
pub use node_id::local_node_id;
pub use ubus::UbusListener;
#[cfg(unix)]
pub use unix_socket::UnixSocketListener;

/// Callback a listener invokes for every event: `(controller_id, notification)`.
pub type NotificationCallback<'a> = &'a (dyn Fn(&str, Notification) + Send + Sync);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to bind bus socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited unexpectedly ({status})")]
    Exited { program: String, status: String },

    #[error("bus I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} backend is not available on this platform")]
    Unsupported(&'static str),
}

/// A blocking source of controller notifications.
pub trait BusListener: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Blocks, invoking `on_notification` for every event, until
    /// [`disconnect`](Self::disconnect) is called or the bus fails.
    ///
    /// Malformed events are logged and skipped; they never end the call.
    fn listen(&self, on_notification: NotificationCallback<'_>) -> Result<(), BusError>;

    /// Asks a running `listen()` to return.  Safe to call from any thread,
    /// more than once, and before `listen()` has started.
    fn disconnect(&self);
}

/// Builds the listener selected by `config`, stamping `controller_id` on
/// every notification it reads.
pub fn build_listener(config: &BusConfig, controller_id: String) -> Arc<dyn BusListener> {
    match config {
        #[cfg(unix)]
        BusConfig::UnixSocket { path } => Arc::new(UnixSocketListener::new(path, controller_id)),
        #[cfg(not(unix))]
        BusConfig::UnixSocket { .. } => Arc::new(Unsupported("unix-socket")),
        BusConfig::Ubus { path } => Arc::new(UbusListener::new(path, controller_id)),
    }
}

/// Stand-in for a backend the platform cannot provide; `listen()` fails at once.
#[cfg(not(unix))]
struct Unsupported(&'static str);

#[cfg(not(unix))]
impl BusListener for Unsupported {
    fn name(&self) -> &'static str {
        self.0
    }

    fn listen(&self, _on_notification: NotificationCallback<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported(self.0))
    }

    fn disconnect(&self) {}
}
