//! ubus bus backend.
//!
//! Runs `ubus -s <socket> listen` and reads its output, one event per line:
//!
//! ```text
//! { "foris-controller": {"module":"web","action":"set_language","kind":"notification","data":{"language":"cs"}} }
//! ```
//!
//! Each event payload that has the shape of a notification is forwarded.
//! [`disconnect`](BusListener::disconnect) kills the child, which ends the
//! output stream and with it `listen()`.

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_core::Notification;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{BusError, BusListener, NotificationCallback};

const DEFAULT_PROGRAM: &str = "ubus";

pub struct UbusListener {
    program: PathBuf,
    socket: PathBuf,
    controller_id: String,
    child: Mutex<Option<Child>>,
    disconnected: AtomicBool,
}

impl UbusListener {
    pub fn new(socket: impl Into<PathBuf>, controller_id: String) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            socket: socket.into(),
            controller_id,
            child: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Overrides the `ubus` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn stopped(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Forwards every notification found in one output line.
    fn handle_line(&self, line: &str, on_notification: NotificationCallback<'_>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let events = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(events)) => events,
            Ok(other) => {
                warn!("ubus bus: skipping non-object event {other}");
                return;
            }
            Err(e) => {
                warn!("ubus bus: skipping malformed line: {e}");
                return;
            }
        };

        for (event, payload) in events {
            match serde_json::from_value::<Notification>(payload) {
                Ok(notification) => {
                    debug!(
                        "ubus bus: {event}: {}/{} received",
                        notification.module, notification.action
                    );
                    on_notification(&self.controller_id, notification);
                }
                Err(e) => debug!("ubus bus: event {event} is not a notification: {e}"),
            }
        }
    }
}

impl BusListener for UbusListener {
    fn name(&self) -> &'static str {
        "ubus"
    }

    fn listen(&self, on_notification: NotificationCallback<'_>) -> Result<(), BusError> {
        let stdout = {
            let mut slot = self.child();
            // Checked under the lock so a concurrent disconnect either sees
            // the child or prevents it from being started.
            if self.stopped() {
                return Ok(());
            }
            let mut child = Command::new(&self.program)
                .arg("-s")
                .arg(&self.socket)
                .arg("listen")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| BusError::Spawn {
                    program: self.program_name(),
                    source,
                })?;
            let stdout = child.stdout.take();
            *slot = Some(child);
            stdout.ok_or_else(|| {
                BusError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe"))
            })?
        };
        info!("ubus bus listening on {}", self.socket.display());

        let mut read_error = None;
        for line in BufReader::new(stdout).lines() {
            match line {
                Ok(line) => self.handle_line(&line, on_notification),
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }

        let status = match self.child().take() {
            Some(mut child) => {
                let _ = child.kill();
                child.wait().map(|s| s.to_string()).unwrap_or_else(|e| e.to_string())
            }
            None => "unknown status".to_string(),
        };

        if self.stopped() {
            return Ok(());
        }
        match read_error {
            Some(e) => Err(BusError::Io(e)),
            None => Err(BusError::Exited {
                program: self.program_name(),
                status,
            }),
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        if let Some(child) = self.child().as_mut() {
            if let Err(e) = child.kill() {
                debug!("ubus bus: kill failed: {e}");
            }
        }
    }
}
