//! The bus bridge thread.
//!
//! [`BusBridge::spawn`] starts a named OS thread that runs
//! [`BusListener::listen`] and publishes every notification it yields into
//! the registry.  The returned [`BusBridgeHandle`] lets `main` stop the
//! listener and wait a bounded time for the thread to exit.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use relay_core::Notification;
use tracing::{debug, error, info, warn};

use super::{BusError, BusListener};
use crate::application::ConnectionRegistry;

const JOIN_POLL: Duration = Duration::from_millis(20);

pub struct BusBridge;

impl BusBridge {
    /// Starts `listener` on its own thread, publishing into `registry`.
    ///
    /// # Errors
    ///
    /// Fails only if the OS refuses to create the thread.
    pub fn spawn(
        listener: Arc<dyn BusListener>,
        registry: Arc<ConnectionRegistry>,
    ) -> io::Result<BusBridgeHandle> {
        let thread_listener = Arc::clone(&listener);
        let thread = thread::Builder::new()
            .name("relay-bus".to_string())
            .spawn(move || bridge_loop(thread_listener.as_ref(), &registry))?;

        info!("{} bus bridge started", listener.name());
        Ok(BusBridgeHandle {
            listener,
            thread: Some(thread),
        })
    }
}

/// Body of the bridge thread.
fn bridge_loop(listener: &dyn BusListener, registry: &ConnectionRegistry) -> Result<(), BusError> {
    let on_notification = |controller_id: &str, notification: Notification| {
        let module = notification.module.clone();
        registry.publish(controller_id, &module, notification);
    };

    let result = listener.listen(&on_notification);
    match &result {
        Ok(()) => info!("{} bus listener stopped", listener.name()),
        Err(e) => error!("{} bus listener failed: {e}", listener.name()),
    }
    result
}

/// Control handle for a running bridge thread.
pub struct BusBridgeHandle {
    listener: Arc<dyn BusListener>,
    thread: Option<JoinHandle<Result<(), BusError>>>,
}

impl BusBridgeHandle {
    /// Asks the listener to stop.  Returns immediately.
    pub fn disconnect(&self) {
        debug!("disconnecting {} bus listener", self.listener.name());
        self.listener.disconnect();
    }

    /// Whether the bridge thread has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits up to `limit` for the thread to exit.
    ///
    /// Returns `true` if it exited in time.  Otherwise the thread is left
    /// running detached and `false` is returned.
    pub fn join_timeout(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "{} bus listener did not stop within {limit:?}",
                    self.listener.name()
                );
                return false;
            }
            thread::sleep(JOIN_POLL);
        }

        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Ok(())) => debug!("bus bridge thread joined"),
                Ok(Err(e)) => debug!("bus bridge thread joined after error: {e}"),
                Err(_) => error!("bus bridge thread panicked"),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::ChannelListener;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::unbounded_channel;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_bridge_publishes_into_registry() {
        // Arrange
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = unbounded_channel();
        let id = registry.register(tx);
        registry
            .handle_message(id, r#"{"action":"subscribe","params":"x"}"#)
            .unwrap();
        let _reply = rx.try_recv().unwrap();

        let listener = Arc::new(ChannelListener::new());
        let injector = listener.injector();
        let mut bridge = BusBridge::spawn(listener, Arc::clone(&registry)).unwrap();

        // Act
        injector.emit("C1", Notification::new("x", "changed", json!({"a": 1})));
        injector.emit("C1", Notification::new("y", "changed", Value::Null));

        // Assert
        let mut frame = None;
        assert!(wait_until(|| {
            frame = rx.try_recv().ok();
            frame.is_some()
        }));
        let frame: Value = serde_json::from_str(&frame.unwrap()).unwrap();
        assert_eq!(frame["module"], "x");
        assert_eq!(frame["controller_id"], "C1");

        bridge.disconnect();
        assert!(bridge.join_timeout(Duration::from_secs(1)));
        assert!(rx.try_recv().is_err(), "module y must not be delivered");
    }

    #[test]
    fn test_disconnect_stops_thread_within_timeout() {
        let listener = Arc::new(ChannelListener::new());
        let mut bridge =
            BusBridge::spawn(listener, Arc::new(ConnectionRegistry::new())).unwrap();

        assert!(!bridge.is_finished());
        bridge.disconnect();

        assert!(bridge.join_timeout(Duration::from_secs(1)));
        assert!(bridge.is_finished());
    }

    #[test]
    fn test_join_timeout_gives_up_on_stuck_listener() {
        // Never disconnected, so the listener keeps blocking.
        let listener = Arc::new(ChannelListener::new());
        let shared: Arc<dyn BusListener> = listener.clone();
        let mut bridge = BusBridge::spawn(shared, Arc::new(ConnectionRegistry::new())).unwrap();

        let joined = bridge.join_timeout(Duration::from_millis(100));

        assert!(!joined);
        listener.disconnect();
        assert!(bridge.join_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_listener_failure_finishes_thread() {
        let listener = Arc::new(ChannelListener::failing());
        let bridge = BusBridge::spawn(listener, Arc::new(ConnectionRegistry::new())).unwrap();

        assert!(wait_until(|| bridge.is_finished()));
    }
}
