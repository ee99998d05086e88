//! Authentication delegated to the ubus session daemon.
//!
//! The browser's `foris.ws.session` cookie is a ubus RPC session id.  The
//! connection is admitted iff that session may call `listen-allowed` on the
//! `websocket-listen` object:
//!
//! ```text
//! ubus [-s <socket>] call session access \
//!     '{"ubus_rpc_session":"<token>","scope":"ubus","object":"websocket-listen","function":"listen-allowed"}'
//! → {"access": true}
//! ```
//!
//! The query runs the `ubus` command-line tool as a child process with a
//! time limit.  Anything other than a clean `{"access": true}` is a reject.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{AuthDecision, Authenticator, ConnectionRequest};

/// Cookie carrying the ubus session id.
pub const UBUS_SESSION_COOKIE: &str = "foris.ws.session";

const DEFAULT_PROGRAM: &str = "ubus";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UbusAuthenticator {
    program: PathBuf,
    socket: Option<PathBuf>,
    call_timeout: Duration,
}

impl UbusAuthenticator {
    /// `socket` of `None` lets `ubus` pick its default daemon socket.
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            socket,
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the `ubus` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Arguments passed to `ubus` to check `token`.
    fn command_args(&self, token: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if let Some(socket) = &self.socket {
            args.push("-s".to_string());
            args.push(socket.display().to_string());
        }
        args.extend(["call", "session", "access"].map(String::from));
        args.push(access_request(token).to_string());
        args
    }

    /// Runs the access query.  `None` means the daemon could not be asked.
    async fn query(&self, token: &str) -> Option<bool> {
        let child = Command::new(&self.program)
            .args(self.command_args(token))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to run {}: {e}", self.program.display());
                return None;
            }
        };

        let output = match timeout(self.call_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("ubus session query failed: {e}");
                return None;
            }
            Err(_) => {
                warn!("ubus session query timed out after {:?}", self.call_timeout);
                return None;
            }
        };
        if !output.status.success() {
            debug!("ubus session query exited with {}", output.status);
            return None;
        }
        parse_access_reply(&output.stdout)
    }
}

/// The `session access` request for `token`.
fn access_request(token: &str) -> Value {
    json!({
        "ubus_rpc_session": token,
        "scope": "ubus",
        "object": "websocket-listen",
        "function": "listen-allowed",
    })
}

/// `Some(access)` for a well-formed reply, `None` otherwise.
fn parse_access_reply(stdout: &[u8]) -> Option<bool> {
    let reply: Value = serde_json::from_slice(stdout).ok()?;
    reply.get("access")?.as_bool()
}

#[async_trait]
impl Authenticator for UbusAuthenticator {
    fn name(&self) -> &'static str {
        "ubus"
    }

    async fn authenticate(&self, request: &ConnectionRequest) -> AuthDecision {
        if !request.has_cookies() {
            debug!("rejecting {}: no cookie", request.path);
            return AuthDecision::forbidden("Missing Cookie");
        }
        let Some(token) = request.cookie(UBUS_SESSION_COOKIE) else {
            debug!("rejecting {}: no {UBUS_SESSION_COOKIE} cookie", request.path);
            return AuthDecision::forbidden("Missing session in cookie");
        };

        match self.query(&token).await {
            Some(true) => {
                debug!("ubus session {token} granted");
                AuthDecision::Admit
            }
            Some(false) => {
                debug!("ubus session {token} may not listen");
                AuthDecision::forbidden("Access denied")
            }
            None => {
                debug!("ubus session {token} not found");
                AuthDecision::forbidden("Session not found")
            }
        }
    }
}
