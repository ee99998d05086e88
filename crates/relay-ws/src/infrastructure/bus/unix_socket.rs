//! Unix-socket bus backend.
//!
//! The relay binds a Unix stream socket; controllers connect to it and write
//! notifications as frames:
//!
//! ```text
//! ┌──────────────────────┬────────────────────────────────┐
//! │ length: u32 (native) │ length bytes of JSON           │
//! └──────────────────────┴────────────────────────────────┘
//! ```
//!
//! Any number of controllers may be connected at once; each connection is
//! served on its own scoped thread.  All sockets use short timeouts so a
//! [`disconnect`](BusListener::disconnect) is noticed within [`POLL`].

use std::fs;
use std::io::{self, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use relay_core::Notification;
use tracing::{debug, info, warn};

use super::{BusError, BusListener, NotificationCallback};

/// How often blocked accepts and reads re-check the disconnect flag.
pub const POLL: Duration = Duration::from_millis(200);

/// Frames larger than this are treated as a broken stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct UnixSocketListener {
    path: PathBuf,
    controller_id: String,
    disconnected: AtomicBool,
}

enum Fill {
    Done,
    Eof,
    Stopped,
}

impl UnixSocketListener {
    pub fn new(path: impl Into<PathBuf>, controller_id: String) -> Self {
        Self {
            path: path.into(),
            controller_id,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stopped(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn bind(&self) -> Result<UnixListener, BusError> {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed stale socket {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {e}", self.path.display()),
        }
        let listener = UnixListener::bind(&self.path).map_err(|source| BusError::Bind {
            path: self.path.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Reads frames from one controller until it hangs up or the listener
    /// is disconnected.
    fn serve_connection(&self, mut stream: UnixStream, on_notification: NotificationCallback<'_>) {
        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(POLL)))
        {
            warn!("unix-socket bus: cannot configure connection: {e}");
            return;
        }
        debug!("unix-socket bus: controller connected");

        let mut header = [0u8; 4];
        loop {
            match self.fill(&mut stream, &mut header) {
                Ok(Fill::Done) => {}
                Ok(Fill::Eof | Fill::Stopped) => break,
                Err(e) => {
                    warn!("unix-socket bus: read error: {e}");
                    break;
                }
            }
            let len = u32::from_ne_bytes(header) as usize;
            if len > MAX_FRAME_LEN {
                warn!("unix-socket bus: frame of {len} bytes exceeds limit; dropping connection");
                break;
            }

            let mut payload = vec![0u8; len];
            match self.fill(&mut stream, &mut payload) {
                Ok(Fill::Done) => {}
                Ok(Fill::Eof) => {
                    warn!("unix-socket bus: connection closed mid-frame");
                    break;
                }
                Ok(Fill::Stopped) => break,
                Err(e) => {
                    warn!("unix-socket bus: read error: {e}");
                    break;
                }
            }

            match serde_json::from_slice::<Notification>(&payload) {
                Ok(notification) => {
                    debug!(
                        "unix-socket bus: {}/{} received",
                        notification.module, notification.action
                    );
                    on_notification(&self.controller_id, notification);
                }
                Err(e) => warn!("unix-socket bus: skipping malformed notification: {e}"),
            }
        }
        debug!("unix-socket bus: controller disconnected");
    }

    /// Fills `buf` completely, tolerating read timeouts.
    fn fill(&self, stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<Fill> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.stopped() {
                return Ok(Fill::Stopped);
            }
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Fill::Done)
    }
}

impl BusListener for UnixSocketListener {
    fn name(&self) -> &'static str {
        "unix-socket"
    }

    fn listen(&self, on_notification: NotificationCallback<'_>) -> Result<(), BusError> {
        let listener = self.bind()?;
        info!("unix-socket bus listening on {}", self.path.display());

        let result = thread::scope(|scope| {
            while !self.stopped() {
                match listener.accept() {
                    Ok((stream, _)) => {
                        scope.spawn(move || self.serve_connection(stream, on_notification));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        // Connection threads must see the flag before the scope can end.
                        self.disconnect();
                        return Err(BusError::Io(e));
                    }
                }
            }
            Ok(())
        });

        if let Err(e) = fs::remove_file(&self.path) {
            debug!("could not remove {}: {e}", self.path.display());
        }
        result
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

/// Timeout, would-block and interrupt errors are retried.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Mutex;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_ne_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn collect(listener: &UnixSocketListener, stream: UnixStream) -> Vec<(String, Notification)> {
        let seen = Mutex::new(Vec::new());
        listener.serve_connection(stream, &|controller_id: &str, n: Notification| {
            seen.lock().unwrap().push((controller_id.to_string(), n));
        });
        seen.into_inner().unwrap()
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_retryable(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_retryable(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_serve_connection_decodes_frames_and_stamps_node_id() {
        // Arrange
        let listener = UnixSocketListener::new("/unused", "00000A1B2C3D4E5F".into());
        let (mut controller, relay_side) = UnixStream::pair().unwrap();
        let body = json!({
            "module": "web",
            "action": "set_language",
            "kind": "notification",
            "data": {"language": "cs"},
        });
        controller.write_all(&frame(body.to_string().as_bytes())).unwrap();
        drop(controller);

        // Act
        let seen = collect(&listener, relay_side);

        // Assert
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "00000A1B2C3D4E5F");
        assert_eq!(seen[0].1.module, "web");
        assert_eq!(seen[0].1.data, json!({"language": "cs"}));
    }

    #[test]
    fn test_serve_connection_skips_malformed_frames() {
        let listener = UnixSocketListener::new("/unused", "C".into());
        let (mut controller, relay_side) = UnixStream::pair().unwrap();
        controller.write_all(&frame(b"not json")).unwrap();
        controller.write_all(&frame(br#"{"module":"m"}"#)).unwrap();
        controller
            .write_all(&frame(br#"{"module":"ok","action":"a"}"#))
            .unwrap();
        drop(controller);

        let seen = collect(&listener, relay_side);

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.module, "ok");
    }

    #[test]
    fn test_serve_connection_stops_on_truncated_frame() {
        let listener = UnixSocketListener::new("/unused", "C".into());
        let (mut controller, relay_side) = UnixStream::pair().unwrap();
        let mut partial = frame(br#"{"module":"m","action":"a"}"#);
        partial.truncate(10);
        controller.write_all(&partial).unwrap();
        drop(controller);

        assert!(collect(&listener, relay_side).is_empty());
    }

    #[test]
    fn test_serve_connection_drops_oversized_frame() {
        let listener = UnixSocketListener::new("/unused", "C".into());
        let (mut controller, relay_side) = UnixStream::pair().unwrap();
        controller
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_ne_bytes())
            .unwrap();

        let seen = collect(&listener, relay_side);

        assert!(seen.is_empty());
    }

    #[test]
    fn test_serve_connection_returns_after_disconnect() {
        let listener = UnixSocketListener::new("/unused", "C".into());
        let (_controller, relay_side) = UnixStream::pair().unwrap();
        listener.disconnect();

        // The controller end stays open; only the flag ends the loop.
        assert!(collect(&listener, relay_side).is_empty());
    }
}
