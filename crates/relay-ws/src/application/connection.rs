//! Per-client connection state and the client control protocol.
//!
//! A [`Connection`] owns three things:
//!
//! - its [`ClientId`];
//! - an [`Outbox`], the only way to get a frame to the client;
//! - the client's [`SubscriptionSet`].
//!
//! # Send path
//!
//! `Outbox` wraps the sending half of an unbounded tokio mpsc channel.  The
//! receiving half is drained by exactly one writer task per websocket (see
//! `infrastructure::ws_server`), which is the only code that ever touches the
//! websocket sink.  That gives three properties at once:
//!
//! - Sending never blocks and never awaits, so it is safe from the bus thread
//!   as well as from inside the runtime.
//! - Replies and notifications for one client cannot interleave mid-frame;
//!   they are written one after another in the order they were queued.
//! - A slow client only grows its own queue; nobody else waits on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relay_core::{Action, ClientId, ClientRequest, ModuleList, ServerReply, SubscriptionSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// A frame could not be queued for a client.
#[derive(Debug, Error)]
pub enum SendError {
    /// [`Connection::close`] was called; no new frames are accepted.
    #[error("client {0} is closing")]
    Exiting(ClientId),

    /// The writer task is gone, i.e. the websocket is closed.
    #[error("client {0}: outbound channel closed")]
    Closed(ClientId),

    #[error("client {client_id}: failed to serialize message: {source}")]
    Serialize {
        client_id: ClientId,
        #[source]
        source: serde_json::Error,
    },
}

/// Cloneable, thread-safe handle for queueing text frames to one client.
#[derive(Debug, Clone)]
pub struct Outbox {
    client_id: ClientId,
    tx: UnboundedSender<String>,
    exiting: Arc<AtomicBool>,
}

impl Outbox {
    fn new(client_id: ClientId, tx: UnboundedSender<String>) -> Self {
        Self {
            client_id,
            tx,
            exiting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Queues an already-serialized frame.
    ///
    /// # Errors
    ///
    /// [`SendError::Exiting`] after `close()`, [`SendError::Closed`] once the
    /// writer task has dropped its receiver.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        if self.exiting.load(Ordering::Acquire) {
            return Err(SendError::Exiting(self.client_id));
        }
        self.tx
            .send(text)
            .map_err(|_| SendError::Closed(self.client_id))
    }

    /// Serializes `message` to JSON and queues it.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(message).map_err(|source| SendError::Serialize {
            client_id: self.client_id,
            source,
        })?;
        debug!("queueing message to client {}: {text}", self.client_id);
        self.send_text(text)
    }
}

/// State of one live websocket client.
#[derive(Debug)]
pub struct Connection {
    client_id: ClientId,
    outbox: Outbox,
    modules: SubscriptionSet,
}

impl Connection {
    /// Creates a connection whose frames go to `tx`.
    pub fn new(client_id: ClientId, tx: UnboundedSender<String>) -> Self {
        Self {
            client_id,
            outbox: Outbox::new(client_id, tx),
            modules: SubscriptionSet::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn modules(&self) -> &SubscriptionSet {
        &self.modules
    }

    pub fn is_subscribed(&self, module: &str) -> bool {
        self.modules.contains(module)
    }

    /// Returns a handle that can queue frames after the registry lock is released.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Adds `modules` to the subscriptions and reports the resulting set.
    pub fn subscribe(&mut self, modules: &ModuleList) -> ServerReply {
        debug!(
            "subscribing client {} to modules {:?}",
            self.client_id,
            modules.as_slice()
        );
        self.modules.subscribe(modules.as_slice().iter().cloned());
        self.log_subscriptions();
        ServerReply::subscriptions(&self.modules)
    }

    /// Removes `modules` from the subscriptions and reports the resulting set.
    pub fn unsubscribe(&mut self, modules: &ModuleList) -> ServerReply {
        debug!(
            "unsubscribing client {} from modules {:?}",
            self.client_id,
            modules.as_slice()
        );
        self.modules.unsubscribe(modules.as_slice());
        self.log_subscriptions();
        ServerReply::subscriptions(&self.modules)
    }

    /// Applies one raw control frame and returns the reply for the client.
    ///
    /// Protocol violations become an error reply; they never fail the call.
    pub fn respond(&mut self, raw: &str) -> ServerReply {
        match ClientRequest::parse(raw) {
            Ok(ClientRequest {
                action: Action::Subscribe,
                modules,
            }) => self.subscribe(&modules),
            Ok(ClientRequest {
                action: Action::Unsubscribe,
                modules,
            }) => self.unsubscribe(&modules),
            Err(e) => {
                warn!("client {}: rejected message: {e}", self.client_id);
                ServerReply::from(e)
            }
        }
    }

    /// Applies one raw control frame and queues the reply.
    ///
    /// # Errors
    ///
    /// Only if the reply cannot be queued, which means the transport is gone.
    pub fn process_message(&mut self, raw: &str) -> Result<(), SendError> {
        let reply = self.respond(raw);
        self.send(&reply)
    }

    /// Serializes and queues `message` for this client.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), SendError> {
        self.outbox.send(message)
    }

    /// Marks the connection as exiting.  Frames already queued are still
    /// written; new ones are refused.
    pub fn close(&self) {
        self.outbox.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.outbox.exiting.load(Ordering::Acquire)
    }

    fn log_subscriptions(&self) {
        debug!(
            "client {} subscriptions: {}",
            self.client_id,
            self.modules.iter().collect::<Vec<_>>().join(", ")
        );
    }
}
