//! Authentication gate for inbound websocket connections.
//!
//! An [`Authenticator`] sees the HTTP upgrade request of every new connection
//! before the websocket handshake completes.  It answers with an
//! [`AuthDecision`]; on `Reject` the client gets a plain HTTP error response
//! and no [`Connection`](crate::application::Connection) is ever created.
//!
//! # Backends
//!
//! | `--authentication` | Type | Checks |
//! |---|---|---|
//! | `none` | [`NoAuthenticator`] | nothing |
//! | `session-file` | [`SessionFileAuthenticator`] | `session` cookie against `<dir>/<token>.json` |
//! | `ubus` | [`UbusAuthenticator`] | `foris.ws.session` cookie against the ubus session daemon |
//!
//! Every backend is fail-closed: if the authority cannot be asked, the answer
//! is `Reject`.

pub mod none;
pub mod session_file;
pub mod ubus;

use std::sync::Arc;

use async_trait::async_trait;
use cookie::Cookie;
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::domain::config::AuthMethod;

pub use none::NoAuthenticator;
pub use session_file::{
    FsSessionStore, Session, SessionFileAuthenticator, SessionStore, SessionStoreError,
};
pub use ubus::UbusAuthenticator;

/// HTTP status used for every authentication rejection.
pub const FORBIDDEN: u16 = 403;

/// The parts of the HTTP upgrade request an authenticator may inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Request target, e.g. `/` or `/ws?x=1`.
    pub path: String,

    pub headers: HeaderMap,
}

impl ConnectionRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Builder-style header append for fixed values.
    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.append(name, HeaderValue::from_static(value));
        self
    }

    /// First value of header `name` if it is visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Whether any `Cookie` header was sent.
    pub fn has_cookies(&self) -> bool {
        self.headers.contains_key(header::COOKIE)
    }

    /// Value of cookie `name` across all `Cookie` headers.
    ///
    /// Names match exactly.  A cookie that is present with an empty value
    /// yields `Some("")`; unparseable pairs are skipped.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }
}

/// Outcome of authenticating one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Admit,
    Reject { status: u16, reason: Vec<u8> },
}

impl AuthDecision {
    /// A 403 rejection carrying `reason` as the response body.
    pub fn forbidden(reason: impl Into<Vec<u8>>) -> Self {
        AuthDecision::Reject {
            status: FORBIDDEN,
            reason: reason.into(),
        }
    }

    pub fn is_admit(&self) -> bool {
        matches!(self, AuthDecision::Admit)
    }
}

/// Decides whether a connection attempt may become a websocket session.
///
/// Called once per attempt, from the task handling that attempt.  Has no
/// access to the registry.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn authenticate(&self, request: &ConnectionRequest) -> AuthDecision;
}

/// Builds the authenticator selected by `method`.
pub fn build_authenticator(method: &AuthMethod) -> Arc<dyn Authenticator> {
    match method {
        AuthMethod::None => Arc::new(NoAuthenticator),
        AuthMethod::SessionFile { dir } => {
            Arc::new(SessionFileAuthenticator::new(Arc::new(FsSessionStore::new(dir))))
        }
        AuthMethod::Ubus { socket } => Arc::new(UbusAuthenticator::new(socket.clone())),
    }
}
