//! Authentication against sessions stored as files by the web application.
//!
//! The web UI writes one JSON file per login session into a shared directory:
//!
//! ```text
//! /tmp/relay-sessions/
//!   3f9c1a0b-….json     {"logged": true, "user": "admin"}
//!   77aa21d4-….json     {"logged": false}
//! ```
//!
//! The browser carries the file stem in its `session` cookie.  A connection
//! is admitted iff that file exists and says `"logged": true`.
//!
//! Tokens are restricted to `[A-Za-z0-9_-]`, so a cookie can never name a
//! path outside the session directory.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{AuthDecision, Authenticator, ConnectionRequest};

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session";

/// Errors from a [`SessionStore`] other than "no such session".
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("invalid session token {0:?}")]
    InvalidToken(String),

    #[error("failed to read session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed session file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The part of a stored session the relay cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub logged: bool,
}

/// Looks sessions up by token.
#[cfg_attr(test, mockall::automock)]
pub trait SessionStore: Send + Sync {
    /// Returns `Ok(None)` when no session with this token exists.
    fn load(&self, token: &str) -> Result<Option<Session>, SessionStoreError>;
}

/// Whether `token` is safe to use as a file stem.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// [`SessionStore`] reading `<dir>/<token>.json`.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
    dir: PathBuf,
}

impl FsSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.json"))
    }
}

impl SessionStore for FsSessionStore {
    fn load(&self, token: &str) -> Result<Option<Session>, SessionStoreError> {
        if !is_valid_token(token) {
            return Err(SessionStoreError::InvalidToken(token.to_string()));
        }
        let path = self.path_for(token);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionStoreError::Io { path, source }),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SessionStoreError::Malformed { path, source })
    }
}

/// Admits connections whose `session` cookie names a logged-in session.
pub struct SessionFileAuthenticator {
    store: Arc<dyn SessionStore>,
}

impl SessionFileAuthenticator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for SessionFileAuthenticator {
    fn name(&self) -> &'static str {
        "session-file"
    }

    async fn authenticate(&self, request: &ConnectionRequest) -> AuthDecision {
        if !request.has_cookies() {
            debug!("rejecting {}: no cookie", request.path);
            return AuthDecision::forbidden("Missing Cookie");
        }
        let Some(token) = request.cookie(SESSION_COOKIE) else {
            debug!("rejecting {}: no {SESSION_COOKIE} cookie", request.path);
            return AuthDecision::forbidden("Missing session in cookie");
        };

        // File reads block; keep them off the runtime's worker threads.
        let store = Arc::clone(&self.store);
        let owned = token.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&owned)).await;

        match loaded {
            Ok(Ok(Some(session))) if session.logged => {
                debug!("session {token} granted");
                AuthDecision::Admit
            }
            Ok(Ok(Some(_))) => {
                debug!("session {token} found but not logged");
                AuthDecision::forbidden("Session not logged")
            }
            Ok(Ok(None)) => {
                debug!("session {token} not found");
                AuthDecision::forbidden("Session not found")
            }
            Ok(Err(e)) => {
                warn!("session lookup failed: {e}");
                AuthDecision::forbidden("Session not found")
            }
            Err(e) => {
                error!("session lookup task failed: {e}");
                AuthDecision::forbidden("Session not found")
            }
        }
    }
}
