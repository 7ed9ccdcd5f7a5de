//! NTRIP Protocol Handler

use super::{Head, NtripRequest, NtripResponse};
use crate::error::AccessError;
use crate::protocol::constants::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// NTRIP handshake handler over any byte stream
pub struct NtripHandler<S> {
    stream: S,
}

impl<S> NtripHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new NTRIP handler for the given stream
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Read a head up to its blank-line terminator.
    ///
    /// Bytes that arrived after the terminator are returned in
    /// [`Head::leftover`]. Fails with `InvalidData` when no terminator shows
    /// up within [`MAX_HEAD_LEN`] bytes and with `UnexpectedEof` when the
    /// peer closes first.
    pub async fn read_head(&mut self) -> io::Result<Head> {
        let mut buf = BytesMut::with_capacity(HEAD_READ_CHUNK);

        loop {
            if let Some((head_len, body_start)) = find_head_end(&buf) {
                let text = String::from_utf8_lossy(&buf[..head_len]).into_owned();
                let leftover = buf.split_off(body_start).freeze();
                return Ok(Head { text, leftover });
            }
            if buf.len() >= MAX_HEAD_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("header exceeds {} bytes", MAX_HEAD_LEN),
                ));
            }

            buf.reserve(HEAD_READ_CHUNK);
            let n = self.stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {} header bytes", buf.len()),
                ));
            }
        }
    }

    /// Read and parse a client request.
    ///
    /// The outer error is a transport failure; the inner one a malformed request.
    pub async fn read_request(&mut self) -> io::Result<Result<NtripRequest, AccessError>> {
        let head = self.read_head().await?;
        Ok(NtripRequest::parse(&head))
    }

    /// Send a response to the client
    pub async fn send_response(&mut self, response: &NtripResponse) -> io::Result<()> {
        self.stream.write_all(&response.encode()).await?;
        self.stream.flush().await
    }

    /// Send a raw request (for client mode)
    pub async fn send_request(&mut self, request: &str) -> io::Result<()> {
        self.stream.write_all(request.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Read the caster's response head (for client mode)
    pub async fn receive_response(&mut self) -> io::Result<Head> {
        self.read_head().await
    }

    /// Get the underlying stream
    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// Locate the end of a head. Returns the head length and where the body starts.
pub fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, HEAD_TERMINATOR).map(|i| (i, i + HEAD_TERMINATOR.len()));
    let bare = find(buf, HEAD_TERMINATOR_BARE).map(|i| (i, i + HEAD_TERMINATOR_BARE.len()));
    match (crlf, bare) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Build the client request for `mountpoint`. The `Authorization` header is
/// left out when `username` is empty.
pub fn build_request(
    host: &str,
    port: u16,
    mountpoint: &str,
    username: &str,
    password: &str,
    user_agent: &str,
) -> String {
    let mut lines = vec![
        format!("GET /{} HTTP/1.1", mountpoint.trim_start_matches('/')),
        format!("Host: {}:{}", host, port),
        format!("User-Agent: {}", user_agent_value(user_agent)),
    ];
    if !username.is_empty() {
        lines.push(format!("Authorization: {}", basic_credentials(username, password)));
    }
    lines.push(format!("{}: {}", NTRIP_VERSION_HEADER, NTRIP_VERSION_2));
    lines.push("Connection: close".to_string());

    let mut request = lines.join("\r\n");
    request.push_str("\r\n\r\n");
    request
}

/// `Basic <base64(username:password)>`
pub fn basic_credentials(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Decode an `Authorization: Basic ...` value into username and password
pub fn decode_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

// Casters key on the `NTRIP ` prefix to tell NTRIP clients from browsers.
fn user_agent_value(user_agent: &str) -> String {
    if user_agent.starts_with("NTRIP ") {
        user_agent.to_string()
    } else {
        format!("NTRIP {}", user_agent)
    }
}
