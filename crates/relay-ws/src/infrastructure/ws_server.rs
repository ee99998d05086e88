//! WebSocket server: accept loop and per-client task management.
//!
//! For every accepted TCP connection this module:
//!
//! 1. Peeks the HTTP upgrade request (see [`handshake`](super::handshake)).
//! 2. Asks the [`Authenticator`] whether the client may connect.  A rejected
//!    client receives the HTTP status and reason and nothing else happens.
//! 3. Completes the websocket handshake and registers a
//!    [`Connection`](crate::application::Connection).
//! 4. Runs two halves until either one ends:
//!    - **writer**: drains the connection's outbox channel into the socket;
//!    - **reader**: hands every inbound text (or binary) frame to
//!      [`ConnectionRegistry::handle_message`].
//! 5. Removes the connection from the registry.
//!
//! # Shutdown
//!
//! The accept loop polls a shared `running` flag every 200 ms.  Open sessions
//! are closed by [`ConnectionRegistry::clear`]: dropping a connection drops
//! its outbox sender, the writer sees the channel end and closes the socket.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};

use crate::application::ConnectionRegistry;
use crate::infrastructure::auth::{AuthDecision, Authenticator};
use crate::infrastructure::handshake::peek_request;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Everything a client session needs, shared by all session tasks.
pub struct ServerContext {
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Limit for receiving the upgrade request and completing the handshake.
    pub handshake_timeout: Duration,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the websocket listener.
///
/// # Errors
///
/// Fails if the address is in use or the process lacks permission to bind it.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!(
        "WebSocket server listening on {}",
        listener.local_addr().unwrap_or(addr)
    );
    Ok(listener)
}

/// Accepts clients on `listener` until `running` is cleared.
///
/// Each client is handled in its own task, so one slow handshake or
/// authentication never delays the others.
pub async fn serve(
    listener: TcpListener,
    context: ServerContext,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let context = Arc::new(context);

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the `running` flag is re-checked regularly.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new connection from {peer_addr}");
                let ctx = Arc::clone(&context);
                tokio::spawn(async move {
                    handle_client(stream, peer_addr, ctx).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. out of file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Per-client handler ────────────────────────────────────────────────────────

async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, context: Arc<ServerContext>) {
    match run_session(stream, peer_addr, &context).await {
        Ok(()) => debug!("session {peer_addr} closed"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

/// Builds the HTTP response sent to a rejected client.
fn reject_response(status: u16, reason: &[u8]) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(String::from_utf8_lossy(reason).into_owned()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
    response
}

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: &ServerContext,
) -> anyhow::Result<()> {
    // ── Step 1: authenticate the upgrade request ──────────────────────────────
    let request = peek_request(&stream, context.handshake_timeout)
        .await
        .with_context(|| format!("no valid upgrade request from {peer_addr}"))?;
    let decision = context.authenticator.authenticate(&request).await;
    let admitted = decision.is_admit();
    if let AuthDecision::Reject { status, reason } = &decision {
        warn!(
            "{peer_addr} rejected by {} authentication: {status} {}",
            context.authenticator.name(),
            String::from_utf8_lossy(reason)
        );
    }

    // ── Step 2: websocket handshake ───────────────────────────────────────────
    //
    // The callback only replays the decision made above.
    let callback = move |_req: &Request, response: Response| match decision {
        AuthDecision::Admit => Ok(response),
        AuthDecision::Reject { status, reason } => Err(reject_response(status, &reason)),
    };
    let handshake = timeout(context.handshake_timeout, accept_hdr_async(stream, callback))
        .await
        .with_context(|| format!("WebSocket handshake with {peer_addr} timed out"))?;
    let ws_stream = match handshake {
        Ok(ws) => ws,
        // The rejection response has been written; nothing else to do.
        Err(_) if !admitted => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("WebSocket handshake failed with {peer_addr}"))
        }
    };

    // ── Step 3: register and run ──────────────────────────────────────────────
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let registry = Arc::clone(&context.registry);
    let client_id = registry.register(out_tx);
    info!("client {client_id} connected from {peer_addr}");

    // Writer: the only code that writes to this socket.
    let writer = async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                debug!("client {client_id}: WebSocket send failed: {e}");
                return;
            }
        }
        // Outbox closed: the connection was removed or the registry cleared.
        let _ = ws_tx.close().await;
    };

    // Reader: inbound control frames.
    let reader = async {
        loop {
            let message = match ws_rx.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                    debug!("client {client_id}: WebSocket closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!("client {client_id}: WebSocket error: {e}");
                    break;
                }
                None => break,
            };

            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                WsMessage::Close(_) => {
                    debug!("client {client_id}: Close frame received");
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };

            if let Err(e) = registry.handle_message(client_id, &text) {
                debug!("client {client_id}: {e}");
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => debug!("client {client_id}: writer ended"),
        _ = reader => debug!("client {client_id}: reader ended"),
    }

    registry.remove(client_id);
    info!("client {client_id} disconnected");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
