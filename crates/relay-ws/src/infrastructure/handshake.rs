//! Reading the HTTP upgrade request before the websocket handshake.
//!
//! Authentication has to look at the request path and cookies, and it is
//! async (it may wait on a child process).  tungstenite's handshake callback
//! is synchronous, so the request head is *peeked* from the socket first:
//! the bytes stay in the kernel buffer and `accept_hdr_async` reads them
//! again afterwards as if nothing happened.
//!
//! The head must arrive within a time limit and fit in a size limit;
//! otherwise the connection is dropped before any state exists.

use std::io;
use std::time::Duration;

use httparse::Status;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::infrastructure::auth::ConnectionRequest;

/// Largest request head accepted.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Header slots offered to the parser, as many as the handshake itself allows.
const MAX_HEADERS: usize = 124;

const PEEK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("socket error while reading request: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection before sending a request")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request head not received within {0:?}")]
    TimedOut(Duration),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Waits for a complete request head on `stream` without consuming it.
pub async fn peek_request(
    stream: &TcpStream,
    time_limit: Duration,
) -> Result<ConnectionRequest, HandshakeError> {
    timeout(time_limit, peek_head(stream, MAX_REQUEST_HEAD))
        .await
        .map_err(|_| HandshakeError::TimedOut(time_limit))?
}

async fn peek_head(
    stream: &TcpStream,
    max_len: usize,
) -> Result<ConnectionRequest, HandshakeError> {
    let mut buf = vec![0u8; max_len];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        if let Some(request) = parse_request_head(&buf[..n])? {
            return Ok(request);
        }
        if n >= max_len {
            return Err(HandshakeError::TooLarge(max_len));
        }
        // `peek` returns at once while data is buffered; wait for more.
        if n == seen {
            sleep(PEEK_INTERVAL).await;
        }
        seen = n;
    }
}

/// Parses the request line and header fields at the start of `bytes`.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request_head(bytes: &[u8]) -> Result<Option<ConnectionRequest>, HandshakeError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    match parsed.parse(bytes) {
        Ok(Status::Partial) => return Ok(None),
        Ok(Status::Complete(_)) => {}
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    }

    let path = parsed
        .path
        .ok_or_else(|| HandshakeError::Malformed("missing request target".to_string()))?;
    let mut request = ConnectionRequest::new(path);
    for field in parsed.headers.iter() {
        let name = HeaderName::from_bytes(field.name.as_bytes())
            .map_err(|e| HandshakeError::Malformed(format!("header {:?}: {e}", field.name)))?;
        let value = HeaderValue::from_bytes(field.value)
            .map_err(|e| HandshakeError::Malformed(format!("header {:?}: {e}", field.name)))?;
        request.headers.append(name, value);
    }
    Ok(Some(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Cookie: session=abc; lang=cs\r\n\
        \r\n";

    #[test]
    fn test_parse_request_head_extracts_path_and_headers() {
        let request = parse_request_head(REQUEST).unwrap().unwrap();

        assert_eq!(request.path, "/ws");
        assert_eq!(request.header("host"), Some("localhost"));
        assert_eq!(request.cookie("session").as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_request_head_accepts_bare_line_feeds() {
        let head = b"GET /ws HTTP/1.1\nHost: x\nUpgrade: websocket\nCookie: session=abc\n\n";

        let request = parse_request_head(head).unwrap().unwrap();

        assert_eq!(request.path, "/ws");
        assert_eq!(request.header("upgrade"), Some("websocket"));
        assert_eq!(request.cookie("session").as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_request_head_incomplete_is_none() {
        let result = parse_request_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap();

        assert!(result.is_none());
    }

    #[test]
    fn test_parse_request_head_rejects_garbage() {
        let result = parse_request_head(b"hello\r\n\r\n");

        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn test_parse_request_head_rejects_header_without_colon() {
        let result = parse_request_head(b"GET / HTTP/1.1\r\nnonsense\r\n\r\n");

        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_peek_request_leaves_bytes_unread() {
        // Arrange
        let (mut client, server) = connected_pair().await;
        client.write_all(REQUEST).await.unwrap();

        // Act
        let request = peek_request(&server, Duration::from_secs(2)).await.unwrap();

        // Assert: the same bytes are still there to be read.
        let mut buf = vec![0u8; REQUEST.len()];
        let n = server.peek(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &REQUEST[..n]);
        assert_eq!(request.path, "/ws");
    }

    #[tokio::test]
    async fn test_peek_request_waits_for_split_head() {
        let (mut client, server) = connected_pair().await;
        let (first, second) = REQUEST.split_at(20);

        let writer = tokio::spawn(async move {
            client.write_all(first).await.unwrap();
            sleep(Duration::from_millis(50)).await;
            client.write_all(second).await.unwrap();
            client
        });
        let request = peek_request(&server, Duration::from_secs(2)).await.unwrap();
        let _client = writer.await.unwrap();

        assert_eq!(request.cookie("lang").as_deref(), Some("cs"));
    }

    #[tokio::test]
    async fn test_peek_request_completes_on_bare_line_feeds() {
        // Arrange
        let (mut client, server) = connected_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\nHost: x\nUpgrade: websocket\nConnection: Upgrade\n\n")
            .await
            .unwrap();

        // Act
        let result = peek_request(&server, Duration::from_millis(500)).await;

        // Assert
        let request = result.unwrap();
        assert_eq!(request.path, "/");
        assert_eq!(request.header("connection"), Some("Upgrade"));
    }

    #[tokio::test]
    async fn test_peek_request_times_out_on_silent_peer() {
        let (_client, server) = connected_pair().await;

        let result = peek_request(&server, Duration::from_millis(100)).await;

        assert!(matches!(result, Err(HandshakeError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_peek_request_reports_closed_peer() {
        let (client, server) = connected_pair().await;
        drop(client);

        let result = peek_request(&server, Duration::from_secs(2)).await;

        assert!(matches!(result, Err(HandshakeError::Closed)));
    }

    #[tokio::test]
    async fn test_peek_request_rejects_oversized_head() {
        let (mut client, server) = connected_pair().await;
        let mut big = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD));
        let writer = tokio::spawn(async move {
            let _ = client.write_all(&big).await;
            client
        });

        let result = peek_request(&server, Duration::from_secs(2)).await;
        let _client = writer.await.unwrap();

        assert!(matches!(result, Err(HandshakeError::TooLarge(_))));
    }
}
