//! RFC 6455 opening handshake
//!
//! Upgrades a freshly accepted TCP stream to a WebSocket:
//!
//! 1. read the HTTP upgrade request (bounded in size and time)
//! 2. extract `Sec-WebSocket-Key`
//! 3. answer `101 Switching Protocols` with the derived `Sec-WebSocket-Accept`
//!
//! Any bytes the client sent after the blank line that ends the request are
//! handed back so the frame decoder sees them.

use crate::core::error::{GatewayError, HandshakeError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use bytes::BytesMut;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// GUID appended to the client key before hashing (RFC 6455 Section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target, e.g. `/` or `/ws`
    pub path: String,
    /// Raw `Sec-WebSocket-Key` value
    pub key: String,
}

impl HandshakeRequest {
    /// The accept token this request must be answered with
    pub fn accept_key(&self) -> String {
        accept_key(&self.key)
    }
}

/// Compute `Sec-WebSocket-Accept` for a client key
///
/// base64(SHA-1(key + GUID))
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    Base64.encode(hasher.finalize())
}

fn key_regex() -> &'static Regex {
    static KEY_REGEX: OnceLock<Regex> = OnceLock::new();
    KEY_REGEX.get_or_init(|| Regex::new(r"(?im)^Sec-WebSocket-Key:[ \t]*(\S+)[ \t]*\r?$").unwrap())
}

fn request_line_regex() -> &'static Regex {
    static REQUEST_LINE: OnceLock<Regex> = OnceLock::new();
    REQUEST_LINE.get_or_init(|| Regex::new(r"^GET (\S+) HTTP/1\.1\r?$").unwrap())
}

/// Parse the header block of an upgrade request
pub fn parse_request(raw: &[u8]) -> Result<HandshakeRequest, HandshakeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HandshakeError::MalformedRequest("request is not valid UTF-8".to_string()))?;

    let request_line = text.lines().next().unwrap_or_default();
    let path = request_line_regex()
        .captures(request_line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| HandshakeError::MalformedRequest(request_line.trim().to_string()))?;

    let key = key_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(HandshakeRequest { path, key })
}

/// The `101 Switching Protocols` response for an accept token
pub fn response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// Response sent before dropping a connection whose upgrade failed
pub fn bad_request(error: &HandshakeError) -> String {
    let body = error.to_string();
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

/// Position just past the blank line ending the header block
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Read and parse the upgrade request
///
/// Returns the request and whatever followed it in the same reads.
pub async fn read_request<S>(
    stream: &mut S,
    max_bytes: usize,
    timeout: Duration,
) -> Result<(HandshakeRequest, BytesMut), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let read = async {
        loop {
            if let Some(end) = header_end(&buf) {
                return Ok(end);
            }
            if buf.len() >= max_bytes {
                return Err(HandshakeError::TooLarge { max: max_bytes });
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return Err(HandshakeError::ConnectionClosed),
                Ok(_) => {}
            }
        }
    };

    let end = tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    if end > max_bytes {
        return Err(HandshakeError::TooLarge { max: max_bytes });
    }

    let leftover = buf.split_off(end);
    let request = parse_request(&buf)?;
    Ok((request, leftover))
}

/// Perform the full server side of the handshake
///
/// On a rejected request a `400 Bad Request` is written (best effort) before
/// the error is returned; the caller drops the stream.
pub async fn negotiate<S>(
    stream: &mut S,
    max_bytes: usize,
    timeout: Duration,
) -> Result<(HandshakeRequest, BytesMut), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, leftover) = match read_request(stream, max_bytes, timeout).await {
        Ok(parsed) => parsed,
        Err(e) => {
            if matches!(
                e,
                HandshakeError::MissingKey
                    | HandshakeError::MalformedRequest(_)
                    | HandshakeError::TooLarge { .. }
            ) {
                let _ = stream.write_all(bad_request(&e).as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            return Err(e.into());
        }
    };

    stream
        .write_all(response(&request.accept_key()).as_bytes())
        .await?;
    stream.flush().await?;

    Ok((request, leftover))
}
