//! Process-wide registry of live websocket connections.
//!
//! The registry is the seam between the two execution domains of the relay:
//!
//! ```text
//!  bus thread (blocking)              tokio runtime
//!  ---------------------              -------------
//!  listener --publish()--+            reader task --handle_message()--+
//!                        v                                            |
//!               +--------------------+                                |
//!               | ConnectionRegistry |<-------------------------------+
//!               +---------+----------+
//!                         | Outbox::send_text (non-blocking)
//!                         v
//!               per-connection mpsc --> writer task --> websocket
//! ```
//!
//! One coarse `std::sync::Mutex` guards the map.  It is only ever held for
//! in-memory work (map edits, subscription edits, channel sends) and never
//! across an `.await`, so the bus thread and runtime tasks can both take it.
//! A poisoned lock is recovered: the map holds no invariant that a panicking
//! holder could have left half-updated.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_core::{ClientId, ClientIdAllocator, Notification};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::application::connection::{Connection, Outbox, SendError};

/// Owns every live [`Connection`], keyed by [`ClientId`].
///
/// Construct one per server and share it as `Arc<ConnectionRegistry>`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    ids: ClientIdAllocator,
    connections: Mutex<HashMap<ClientId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a connection whose frames are queued on `outbound` and returns
    /// its freshly allocated id.
    pub fn register(&self, outbound: UnboundedSender<String>) -> ClientId {
        let mut connections = self.lock();
        // Allocated under the lock so ids enter the map in issue order.
        let client_id = self.ids.allocate();
        connections.insert(client_id, Connection::new(client_id, outbound));
        info!(
            "client {client_id} registered ({} connected)",
            connections.len()
        );
        client_id
    }

    /// Removes a connection.  Returns `true` if it was present.
    pub fn remove(&self, client_id: ClientId) -> bool {
        let mut connections = self.lock();
        match connections.remove(&client_id) {
            Some(connection) => {
                connection.close();
                info!(
                    "client {client_id} removed ({} connected)",
                    connections.len()
                );
                true
            }
            None => {
                debug!("client {client_id} already removed");
                false
            }
        }
    }

    /// Routes one inbound control frame to its connection.
    ///
    /// An unknown id is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] only when the reply could not be queued, which
    /// means the connection's transport is already gone.
    pub fn handle_message(&self, client_id: ClientId, raw: &str) -> Result<(), SendError> {
        let mut connections = self.lock();
        let Some(connection) = connections.get_mut(&client_id) else {
            warn!("message for unknown client {client_id} dropped");
            return Ok(());
        };
        debug!("client {client_id} sent: {raw}");
        connection.process_message(raw)
    }

    /// Stamps `notification` with `controller_id` and queues it for every
    /// connection subscribed to `module`.
    ///
    /// The frame is serialized once.  A connection whose outbox is closed is
    /// skipped without affecting the others.  Returns how many connections the
    /// frame was queued for.
    pub fn publish(&self, controller_id: &str, module: &str, notification: Notification) -> usize {
        let notification = notification.stamped(controller_id);
        let text = match serde_json::to_string(&notification) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize notification for module {module}: {e}");
                return 0;
            }
        };

        let targets: Vec<Outbox> = self
            .lock()
            .values()
            .filter(|c| !c.is_exiting() && c.is_subscribed(module))
            .map(Connection::outbox)
            .collect();

        let mut delivered = 0;
        for outbox in targets {
            match outbox.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("skipping notification delivery: {e}"),
            }
        }
        debug!(
            "notification {module}/{} from {controller_id} queued for {delivered} client(s)",
            notification.action
        );
        delivered
    }

    /// Current subscriptions of a client, sorted; `None` if it is not registered.
    pub fn subscriptions(&self, client_id: ClientId) -> Option<Vec<String>> {
        self.lock().get(&client_id).map(|c| c.modules().to_vec())
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.lock().contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Closes and drops every connection.  Writer tasks finish once their
    /// queue is drained, which closes the websockets.
    pub fn clear(&self) {
        let mut connections = self.lock();
        let count = connections.len();
        for connection in connections.values() {
            connection.close();
        }
        connections.clear();
        info!("registry cleared ({count} connection(s) dropped)");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn register(registry: &ConnectionRegistry) -> (ClientId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (registry.register(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).expect("frames are JSON"));
        }
        frames
    }

    #[test]
    fn test_register_issues_increasing_ids() {
        let registry = ConnectionRegistry::new();

        let (a, _ra) = register(&registry);
        let (b, _rb) = register(&registry);
        registry.remove(a);
        let (c, _rc) = register(&registry);

        assert!(a < b && b < c);
        assert_eq!(a, ClientId::from_raw(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_twice_is_harmless() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (a, _ra) = register(&registry);
        let (b, _rb) = register(&registry);

        // Act
        let first = registry.remove(a);
        let second = registry.remove(a);
        let unknown = registry.remove(ClientId::from_raw(999));

        // Assert
        assert!(first);
        assert!(!second);
        assert!(!unknown);
        assert!(registry.contains(b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handle_message_for_unknown_client_is_ignored() {
        let registry = ConnectionRegistry::new();

        let result = registry.handle_message(ClientId::from_raw(42), "{}");

        assert!(result.is_ok());
    }

    #[test]
    fn test_handle_message_replies_and_updates_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = register(&registry);

        registry
            .handle_message(id, r#"{"action":"subscribe","params":["b","a"]}"#)
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![json!({"result": true, "subscriptions": ["a", "b"]})]
        );
        assert_eq!(
            registry.subscriptions(id),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_handle_message_surfaces_closed_transport() {
        let registry = ConnectionRegistry::new();
        let (id, rx) = register(&registry);
        drop(rx);

        let result = registry.handle_message(id, r#"{"action":"subscribe","params":"a"}"#);

        assert!(matches!(result, Err(SendError::Closed(_))));
    }

    #[test]
    fn test_publish_reaches_only_subscribers() {
        // Arrange: A subscribes to "x", B to "y"
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = register(&registry);
        let (b, mut rb) = register(&registry);
        registry
            .handle_message(a, r#"{"action":"subscribe","params":["x"]}"#)
            .unwrap();
        registry
            .handle_message(b, r#"{"action":"subscribe","params":["y"]}"#)
            .unwrap();
        drain(&mut ra);
        drain(&mut rb);

        // Act
        let delivered = registry.publish(
            "C1",
            "x",
            Notification::new("x", "changed", json!({"v": 1})),
        );

        // Assert
        assert_eq!(delivered, 1);
        let frames = drain(&mut ra);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["controller_id"], "C1");
        assert_eq!(frames[0]["module"], "x");
        assert_eq!(frames[0]["kind"], "notification");
        assert_eq!(frames[0]["data"], json!({"v": 1}));
        assert!(drain(&mut rb).is_empty());
    }

    #[test]
    fn test_publish_matching_is_case_sensitive() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = register(&registry);
        registry
            .handle_message(id, r#"{"action":"subscribe","params":"Web"}"#)
            .unwrap();
        drain(&mut rx);

        let delivered = registry.publish("C1", "web", Notification::new("web", "a", Value::Null));

        assert_eq!(delivered, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_publish_skips_dead_connection_and_delivers_to_others() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let (dead, dead_rx) = register(&registry);
        let (live, mut live_rx) = register(&registry);
        for id in [dead, live] {
            registry
                .handle_message(id, r#"{"action":"subscribe","params":"m"}"#)
                .unwrap();
        }
        drop(dead_rx);
        drain(&mut live_rx);

        // Act
        let delivered = registry.publish("C1", "m", Notification::new("m", "a", Value::Null));

        // Assert
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut live_rx).len(), 1);
    }

    #[test]
    fn test_publish_with_no_connections_returns_zero() {
        let registry = ConnectionRegistry::new();

        assert_eq!(
            registry.publish("C1", "m", Notification::new("m", "a", Value::Null)),
            0
        );
    }

    #[test]
    fn test_clear_drops_everything_and_closes_outboxes() {
        let registry = ConnectionRegistry::new();
        let (_a, mut ra) = register(&registry);
        let (_b, _rb) = register(&registry);

        registry.clear();

        assert!(registry.is_empty());
        // Every sender is gone, so the writer side sees the channel end.
        assert!(matches!(
            ra.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_concurrent_publish_never_sees_torn_subscriptions() {
        // Arrange
        let registry = Arc::new(ConnectionRegistry::new());
        let (id, mut rx) = register(&registry);

        // Act: one thread toggles {a, b} on and off while another publishes
        // to "a" and "b" as fast as it can.
        let toggler = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..500 {
                    registry
                        .handle_message(id, r#"{"action":"subscribe","params":["a","b"]}"#)
                        .unwrap();
                    registry
                        .handle_message(id, r#"{"action":"unsubscribe","params":["a","b"]}"#)
                        .unwrap();
                }
            })
        };
        let publisher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..500 {
                    registry.publish("C1", "a", Notification::new("a", "n", json!(i)));
                    registry.publish("C1", "b", Notification::new("b", "n", json!(i)));
                }
            })
        };
        toggler.join().unwrap();
        publisher.join().unwrap();

        // Assert: every reply shows the set fully on or fully off.
        for frame in drain(&mut rx) {
            if frame.get("result").is_some() {
                let subs = frame["subscriptions"].as_array().unwrap().len();
                assert!(subs == 0 || subs == 2, "torn set in {frame}");
            }
        }
        assert_eq!(registry.subscriptions(id), Some(vec![]));
    }

    #[test]
    fn test_concurrent_register_remove_keeps_ids_unique() {
        let registry = Arc::new(ConnectionRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..100 {
                        let (tx, _rx) = unbounded_channel();
                        let id = registry.register(tx);
                        registry.remove(id);
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<ClientId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();

        assert_eq!(all.len(), 800);
        assert!(registry.is_empty());
    }
}
