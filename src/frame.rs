//! WebSocket client framing and upgrade handshake (RFC 6455).
//!
//! Implements the subset this sub-protocol needs: single unfragmented
//! frames, text/ping/pong/close opcodes, client-side masking and the HTTP
//! Upgrade handshake with `Sec-WebSocket-Accept` verification.
//!
//! Two safety properties are enforced here rather than in the caller:
//!
//! - A declared payload length above the configured maximum is rejected
//!   **before** any payload byte is read, so a corrupted or malicious
//!   length field cannot trigger a large allocation.
//! - Every read that continues a partially received frame is bounded by a
//!   read timeout, so a half-open socket cannot pin the reader forever
//!   mid-frame. Waiting for the start of the next frame is unbounded; the
//!   health monitor owns silent-connection detection.

use crate::error::{LiveQueryError, Result};
use crate::protocol::SUBPROTOCOL;
use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed GUID appended to the nonce for the accept-key hash (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade response we are willing to buffer.
const MAX_HANDSHAKE_RESPONSE: usize = 16 * 1024;

/// Frame opcodes handled by this sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message (unused by this protocol).
    Continuation,
    /// UTF-8 text payload carrying one JSON message.
    Text,
    /// Binary payload (unused by this protocol).
    Binary,
    /// Connection close.
    Close,
    /// Liveness probe.
    Ping,
    /// Liveness probe response.
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// One parsed WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final-fragment bit.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Close code carried by a close frame, when present.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// XOR a buffer with a 4-byte mask key, cycling every 4 bytes.
///
/// Masking is symmetric; the same call masks and unmasks.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a single unfragmented frame.
///
/// Client-originated frames must carry a mask key; passing `None` produces
/// an unmasked (server-style) frame, which the tests' scripted server uses.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len < 65536 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            let start = frame.len();
            frame.extend_from_slice(payload);
            apply_mask(&mut frame[start..], key);
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

/// Write one masked client frame with a fresh random mask key.
pub async fn write_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let key: [u8; 4] = rand::random();
    let frame = encode_frame(opcode, payload, Some(key));
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read bytes that continue an already-started frame, bounded by `timeout`.
async fn read_continuation<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    what: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if timeout.is_zero() {
        reader.read_exact(buf).await?;
        return Ok(());
    }
    match tokio::time::timeout(timeout, reader.read_exact(buf)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(LiveQueryError::Timeout(format!(
            "reading {} took longer than {:?}",
            what, timeout
        ))),
    }
}

/// Read and unmask one frame.
///
/// Blocks without bound until the first header byte arrives; every
/// subsequent read is bounded by `read_timeout`. A declared payload length
/// above `max_payload` fails with
/// [`MessageTooLarge`](LiveQueryError::MessageTooLarge) before the payload
/// is read.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize, read_timeout: Duration) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            LiveQueryError::Connection("socket closed while waiting for a frame".into())
        } else {
            LiveQueryError::Io(e)
        }
    })?;

    let mut second = [0u8; 1];
    read_continuation(reader, &mut second, read_timeout, "frame header").await?;

    let fin = first[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(first[0] & 0x0F)
        .ok_or_else(|| LiveQueryError::Protocol(format!("unknown opcode {:#x}", first[0] & 0x0F)))?;
    let masked = second[0] & 0x80 != 0;

    let payload_len = match second[0] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            read_continuation(reader, &mut ext, read_timeout, "extended length").await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            read_continuation(reader, &mut ext, read_timeout, "extended length").await?;
            u64::from_be_bytes(ext)
        }
        len => len as u64,
    };

    // Reject before allocating or reading a single payload byte.
    if payload_len > max_payload as u64 {
        return Err(LiveQueryError::MessageTooLarge {
            size: payload_len as usize,
            limit: max_payload,
        });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        read_continuation(reader, &mut key, read_timeout, "mask key").await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    if !payload.is_empty() {
        read_continuation(reader, &mut payload, read_timeout, "frame payload").await?;
    }
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame { fin, opcode, payload: Bytes::from(payload) })
}

/// Generate the random base64 nonce for `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Compute the `Sec-WebSocket-Accept` value expected for a key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Perform the client side of the HTTP Upgrade handshake.
///
/// Sends the GET request with the subprotocol offer, reads headers until
/// the blank line, and requires a 101 status plus a matching accept key.
pub async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {SUBPROTOCOL}\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response = read_http_response(stream, timeout).await?;
    let response_text = String::from_utf8_lossy(&response);

    let status_line = response_text.lines().next().unwrap_or_default();
    if !status_line.contains(" 101") {
        return Err(LiveQueryError::Connection(format!(
            "upgrade rejected: {}",
            status_line.trim()
        )));
    }

    let expected = accept_key(&key);
    let accept = header_value(&response_text, "sec-websocket-accept");
    if accept.as_deref() != Some(expected.as_str()) {
        return Err(LiveQueryError::Connection(
            "upgrade response carried a bad Sec-WebSocket-Accept".into(),
        ));
    }
    Ok(())
}

/// Read an HTTP response up to the header-terminating blank line.
async fn read_http_response<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                return Err(LiveQueryError::Connection(
                    "socket closed during the upgrade handshake".into(),
                ))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(LiveQueryError::Io(e)),
            Err(_) => {
                return Err(LiveQueryError::Timeout(format!(
                    "upgrade handshake exceeded {:?}",
                    timeout
                )))
            }
        };
        response.extend_from_slice(&buf[..n]);
        if let Some(end) = find_header_end(&response) {
            response.truncate(end);
            return Ok(response);
        }
        if response.len() > MAX_HANDSHAKE_RESPONSE {
            return Err(LiveQueryError::Protocol("oversized upgrade response".into()));
        }
    }
}

/// Position just past the `\r\n\r\n` header terminator, when present.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Case-insensitive lookup of a header value in raw response text.
fn header_value(response: &str, name: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}
