//! In-memory bus listener for tests.
//!
//! Lets tests inject notifications as if a controller had sent them over a
//! real bus, without a socket or a `ubus` daemon.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use relay_core::Notification;
use tracing::debug;

use super::{BusError, BusListener, NotificationCallback};

const POLL: Duration = Duration::from_millis(50);

type Event = (String, Notification);

/// A [`BusListener`] fed through a [`ChannelInjector`].
pub struct ChannelListener {
    sender: Sender<Event>,
    receiver: Mutex<Receiver<Event>>,
    disconnected: AtomicBool,
    fail: bool,
}

/// Cloneable handle that pushes events into a [`ChannelListener`].
#[derive(Clone)]
pub struct ChannelInjector {
    sender: Sender<Event>,
}

impl ChannelInjector {
    /// Queues one event.  Returns `false` if the listener is gone.
    pub fn emit(&self, controller_id: &str, notification: Notification) -> bool {
        self.sender
            .send((controller_id.to_string(), notification))
            .is_ok()
    }
}

impl ChannelListener {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            disconnected: AtomicBool::new(false),
            fail: false,
        }
    }

    /// A listener whose `listen()` returns an error straight away, like a bus
    /// that cannot be reached.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn injector(&self) -> ChannelInjector {
        ChannelInjector {
            sender: self.sender.clone(),
        }
    }
}

impl Default for ChannelListener {
    fn default() -> Self {
        Self::new()
    }
}

impl BusListener for ChannelListener {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn listen(&self, on_notification: NotificationCallback<'_>) -> Result<(), BusError> {
        if self.fail {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "bus unreachable",
            )));
        }

        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.disconnected.load(Ordering::Acquire) {
            match receiver.recv_timeout(POLL) {
                Ok((controller_id, notification)) => {
                    debug!("channel bus: {} from {controller_id}", notification.module);
                    on_notification(&controller_id, notification);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}
