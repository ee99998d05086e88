//! relay-ws — entry point.
//!
//! Listens for notifications from local controllers on a bus and relays each
//! one to the websocket clients subscribed to its module.
//!
//! # Usage
//!
//! ```text
//! relay-ws [--debug] --authentication <none|session-file|ubus> --host <HOST> --port <PORT>
//!          [--ipv6] [--session-dir <DIR>] [--ubus-auth-socket <PATH>]
//!          [--controller-id <ID>] <unix-socket|ubus> [--path <PATH>]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                  | Default               | Description                        |
//! |---------------------------|-----------------------|------------------------------------|
//! | `RELAY_WS_HOST`           |                       | Host or IP to listen on            |
//! | `RELAY_WS_PORT`           |                       | WebSocket port                     |
//! | `RELAY_WS_AUTH`           |                       | Authentication method              |
//! | `RELAY_WS_SESSION_DIR`    | `/tmp/relay-sessions` | Session files for `session-file`   |
//! | `RELAY_WS_UBUS_AUTH_SOCK` | ubus default          | ubus socket used by `ubus` auth    |
//! | `RELAY_WS_CONTROLLER_ID`  | derived from MAC      | Id stamped on local notifications  |
//!
//! `RUST_LOG` overrides the log level chosen by `--debug`.
//!
//! # Process supervision
//!
//! ```text
//! main ──┬── tokio task:  websocket accept loop
//!        ├── OS thread:   bus bridge (blocking listener)
//!        └── supervisor:  every 200 ms check signal / accept loop / bus thread
//! ```
//!
//! Whichever stops first triggers shutdown: disconnect the bus, stop
//! accepting, clear the registry, then give the bus thread one second to
//! exit.  The process exits non-zero if the bus or the server died.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_ws::application::ConnectionRegistry;
use relay_ws::domain::config::{
    AuthMethod, BusConfig, RelayConfig, DEFAULT_SESSION_DIR, DEFAULT_UBUS_PATH,
    DEFAULT_UNIX_SOCKET_PATH,
};
use relay_ws::infrastructure::auth::build_authenticator;
use relay_ws::infrastructure::bus::{build_listener, local_node_id, BusBridge, BusBridgeHandle};
use relay_ws::infrastructure::ws_server::{bind, serve, ServerContext};

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Relays bus notifications to subscribed websocket clients.
#[derive(Debug, Parser)]
#[command(
    name = "relay-ws",
    about = "Relays bus notifications to subscribed websocket clients",
    version
)]
struct Cli {
    /// Log at debug level (unless RUST_LOG is set).
    #[arg(short, long)]
    debug: bool,

    /// How websocket clients are authenticated.
    #[arg(short, long, value_enum, env = "RELAY_WS_AUTH")]
    authentication: AuthKind,

    /// Host name or IP address to listen on.
    #[arg(long, env = "RELAY_WS_HOST")]
    host: String,

    /// WebSocket port.
    #[arg(long, env = "RELAY_WS_PORT")]
    port: u16,

    /// Listen on IPv6 instead of IPv4.
    #[arg(long)]
    ipv6: bool,

    /// Directory holding session files (`session-file` authentication).
    #[arg(long, default_value = DEFAULT_SESSION_DIR, env = "RELAY_WS_SESSION_DIR")]
    session_dir: PathBuf,

    /// ubus socket used for `ubus` authentication.
    #[arg(long, env = "RELAY_WS_UBUS_AUTH_SOCK")]
    ubus_auth_socket: Option<PathBuf>,

    /// Controller id stamped on notifications from the local bus.
    ///
    /// Derived from the first non-zero MAC address when omitted.
    #[arg(long, env = "RELAY_WS_CONTROLLER_ID")]
    controller_id: Option<String>,

    #[command(subcommand)]
    bus: BusCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthKind {
    None,
    SessionFile,
    Ubus,
}

#[derive(Debug, Subcommand)]
enum BusCommand {
    /// Receive notifications on a Unix stream socket.
    UnixSocket {
        #[arg(long, default_value = DEFAULT_UNIX_SOCKET_PATH)]
        path: PathBuf,
    },

    /// Receive notifications from `ubus listen`.
    Ubus {
        #[arg(long, default_value = DEFAULT_UBUS_PATH)]
        path: PathBuf,
    },
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--host` does not resolve to an address of the
    /// selected family.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let ws_bind_addr = resolve_bind_addr(&self.host, self.port, self.ipv6)?;

        let auth = match self.authentication {
            AuthKind::None => AuthMethod::None,
            AuthKind::SessionFile => AuthMethod::SessionFile {
                dir: self.session_dir,
            },
            AuthKind::Ubus => AuthMethod::Ubus {
                socket: self.ubus_auth_socket,
            },
        };

        let bus = match self.bus {
            BusCommand::UnixSocket { path } => BusConfig::UnixSocket { path },
            BusCommand::Ubus { path } => BusConfig::Ubus { path },
        };

        Ok(RelayConfig {
            ws_bind_addr,
            auth,
            bus,
            controller_id: self.controller_id,
            ..RelayConfig::default()
        })
    }
}

/// Resolves `host` and picks the first address of the requested family.
fn resolve_bind_addr(host: &str, port: u16, ipv6: bool) -> anyhow::Result<SocketAddr> {
    let family = if ipv6 { "IPv6" } else { "IPv4" };
    let candidates = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve host '{host}'"))?;
    for addr in candidates {
        if addr.is_ipv6() == ipv6 {
            return Ok(addr);
        }
    }
    bail!("host '{host}' has no {family} address")
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Signal,
    ServerStopped,
    BusStopped,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ─────────────────────────────────────────────────────────
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_relay_config()?;
    let node_id = local_node_id(config.controller_id.as_deref());
    info!(
        "relay-ws {} starting: ws={}, auth={}, bus={}, controller_id={node_id}",
        env!("CARGO_PKG_VERSION"),
        config.ws_bind_addr,
        config.auth.name(),
        config.bus.name(),
    );

    // ── Wiring ────────────────────────────────────────────────────────────────
    let registry = Arc::new(ConnectionRegistry::new());
    let running = Arc::new(AtomicBool::new(true));

    // Bind before starting the bus so a busy port fails fast.
    let ws_listener = bind(config.ws_bind_addr).await?;

    let mut bridge = BusBridge::spawn(
        build_listener(&config.bus, node_id),
        Arc::clone(&registry),
    )
    .context("failed to start bus bridge thread")?;

    let server = tokio::spawn(serve(
        ws_listener,
        ServerContext {
            registry: Arc::clone(&registry),
            authenticator: build_authenticator(&config.auth),
            handshake_timeout: config.handshake_timeout,
        },
        Arc::clone(&running),
    ));

    let signal_flag = Arc::clone(&running);
    tokio::spawn(async move {
        if wait_for_signal().await {
            signal_flag.store(false, Ordering::Relaxed);
        }
    });

    // ── Supervise ─────────────────────────────────────────────────────────────
    let exit = supervise(&running, &server, &bridge).await;

    // ── Shutdown ──────────────────────────────────────────────────────────────
    info!("shutting down");
    bridge.disconnect();
    running.store(false, Ordering::Relaxed);
    registry.clear();

    let join_limit = config.shutdown_timeout;
    match tokio::task::spawn_blocking(move || bridge.join_timeout(join_limit)).await {
        Ok(true) => {}
        Ok(false) => warn!("bus thread still running; exiting anyway"),
        Err(e) => error!("failed to join bus thread: {e}"),
    }

    match timeout(join_limit, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("websocket server failed: {e:#}"),
        Ok(Err(e)) => error!("websocket server task failed: {e}"),
        Err(_) => warn!("websocket server did not stop within {join_limit:?}"),
    }

    match exit {
        Exit::Signal => {
            info!("relay-ws stopped");
            Ok(())
        }
        Exit::ServerStopped => bail!("websocket server stopped unexpectedly"),
        Exit::BusStopped => bail!("bus listener stopped unexpectedly"),
    }
}

/// Polls until a signal clears `running`, or either worker stops.
async fn supervise(
    running: &AtomicBool,
    server: &JoinHandle<anyhow::Result<()>>,
    bridge: &BusBridgeHandle,
) -> Exit {
    let mut ticker = interval(SUPERVISOR_POLL);
    loop {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            return Exit::Signal;
        }
        if server.is_finished() {
            error!("websocket server is not running; exiting");
            return Exit::ServerStopped;
        }
        if bridge.is_finished() {
            error!("bus listener is not running; exiting");
            return Exit::BusStopped;
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.  Returns `false` if no handler could be
/// installed, in which case only the workers can end the process.
async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        return match result {
                            Ok(()) => {
                                info!("received Ctrl+C; initiating graceful shutdown");
                                true
                            }
                            Err(e) => {
                                error!("failed to listen for Ctrl+C signal: {e}");
                                false
                            }
                        };
                    }
                    _ = term.recv() => {
                        info!("received SIGTERM; initiating graceful shutdown");
                        return true;
                    }
                }
            }
            Err(e) => warn!("failed to listen for SIGTERM: {e}"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received Ctrl+C; initiating graceful shutdown");
            true
        }
        Err(e) => {
            error!("failed to listen for Ctrl+C signal: {e}");
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
