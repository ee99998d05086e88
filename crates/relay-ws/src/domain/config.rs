//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from CLI arguments and environment variables; tests
//! build it directly.  Nothing in here reads the environment or touches the
//! filesystem.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding session files for [`AuthMethod::SessionFile`].
pub const DEFAULT_SESSION_DIR: &str = "/tmp/relay-sessions";

/// Default socket path for the Unix-socket bus.
pub const DEFAULT_UNIX_SOCKET_PATH: &str = "/tmp/relay-notify.soc";

/// Default ubus daemon socket.
pub const DEFAULT_UBUS_PATH: &str = "/var/run/ubus.sock";

/// How inbound websocket connections are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Every connection is admitted.
    None,

    /// The `session` cookie names a JSON file in `dir`; the connection is
    /// admitted iff that session is marked as logged in.
    SessionFile { dir: PathBuf },

    /// The `foris.ws.session` cookie is checked against the ubus session
    /// daemon.  `socket` of `None` lets the `ubus` tool use its default.
    Ubus { socket: Option<PathBuf> },
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::SessionFile { .. } => "session-file",
            AuthMethod::Ubus { .. } => "ubus",
        }
    }
}

/// Which upstream bus notifications are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusConfig {
    /// Length-prefixed JSON frames on a Unix stream socket the relay binds.
    UnixSocket { path: PathBuf },

    /// Events read from `ubus listen` on the given daemon socket.
    Ubus { path: PathBuf },
}

impl BusConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BusConfig::UnixSocket { .. } => "unix-socket",
            BusConfig::Ubus { .. } => "ubus",
        }
    }
}

/// All runtime configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the websocket server binds to.
    pub ws_bind_addr: SocketAddr,

    pub auth: AuthMethod,

    pub bus: BusConfig,

    /// Id stamped on every notification.  `None` derives it from the host's
    /// hardware address.
    pub controller_id: Option<String>,

    /// How long a new TCP connection may take to send its upgrade request.
    pub handshake_timeout: Duration,

    /// How long shutdown waits for the bus thread to exit.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    /// Local-development defaults: no authentication, Unix-socket bus.
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([127, 0, 0, 1], 9080)),
            auth: AuthMethod::None,
            bus: BusConfig::UnixSocket {
                path: PathBuf::from(DEFAULT_UNIX_SOCKET_PATH),
            },
            controller_id: None,
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}
