/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Wire protocol: typed message envelopes and Content-Length framing.
//!
//! Every message on the wire is `"Content-Length: " + n + "\r\n\r\n" + body`,
//! where `body` is exactly `n` UTF-8 bytes of JSON. Content-Length framing is
//! the sole wire contract; there is deliberately no heuristic fallback parser.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Frames larger than this terminate the channel instead of allocating.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// A message in either direction, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client-to-server command.
    Request(Request),
    /// Server reply correlated to a request.
    Response(Response),
    /// Unsolicited server notification.
    Event(Event),
}

/// An outgoing command. Immutable after creation; the sequence number is
/// unique for the lifetime of a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Monotonically increasing correlation id.
    pub seq: u64,
    /// The operation to perform.
    pub command: String,
    /// Named arguments for the command.
    #[serde(default)]
    pub arguments: Value,
}

/// A server reply, matched to its request via `request_seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Server-side sequence number of this message.
    pub seq: u64,
    /// Echo of the request command.
    pub command: String,
    /// Sequence number of the request this answers.
    pub request_seq: u64,
    /// Whether the server keeps running after this response.
    pub running: bool,
    /// Whether the command succeeded.
    pub success: bool,
    /// Error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload; absent for commands without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// An unsolicited server notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Server-side sequence number, when the server assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Event name used for subscription routing.
    pub event: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Request {
    /// Build a request with the given correlation id.
    #[must_use]
    pub const fn new(seq: u64, command: String, arguments: Value) -> Self {
        Self {
            seq,
            command,
            arguments,
        }
    }
}

impl Response {
    /// Decode the body into the shape the call site expects.
    ///
    /// The expected shape is supplied per call, and a mismatch is a distinct
    /// [`Error::Decode`] rather than a generic failure. A missing body
    /// decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the body does not match `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self.body.clone().unwrap_or(Value::Null);
        serde_json::from_value(body).map_err(|e| {
            Error::Decode(format!(
                "response body for '{}' did not match expected shape: {e}",
                self.command
            ))
        })
    }
}

/// Serialize a message and prepend the Content-Length header.
///
/// # Errors
///
/// Returns [`Error::Communication`] if serialization fails.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_string(message)
        .map_err(|e| Error::Communication(format!("failed to serialize message: {e}")))?;
    let mut frame = Vec::with_capacity(body.len() + 32);
    frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

/// Parse one JSON body into a typed message.
///
/// # Errors
///
/// Returns [`Error::Communication`] when the body is not a recognized
/// envelope.
pub fn decode(body: &str) -> Result<Message> {
    serde_json::from_str(body).map_err(|e| Error::Communication(format!("undecodable frame: {e}")))
}

/// Extract the next complete frame body from the buffer, if one is available.
///
/// Partial input returns `Ok(None)` and leaves the buffer untouched so the
/// reader can accumulate more bytes. Malformed headers are a hard
/// [`Error::Communication`]: the caller must treat the stream as broken.
///
/// # Errors
///
/// Returns [`Error::Communication`] for non-UTF-8 headers or bodies, header
/// blocks without a Content-Length, unparsable lengths, and oversized frames.
pub fn try_parse_frame(buffer: &mut BytesMut) -> Result<Option<String>> {
    let mut headers_end = None;
    let mut content_length = None;

    // Scan for \r\n\r\n
    for i in 0..buffer.len().saturating_sub(3) {
        if &buffer[i..i + 4] == b"\r\n\r\n" {
            headers_end = Some(i + 4);

            let headers_str = std::str::from_utf8(&buffer[0..i])
                .map_err(|e| Error::Communication(format!("non-UTF-8 frame header: {e}")))?;

            for line in headers_str.lines() {
                if line.to_ascii_lowercase().starts_with("content-length:") {
                    let parts: Vec<&str> = line.split(':').collect();
                    if parts.len() == 2 {
                        let len = parts[1].trim().parse::<usize>().map_err(|e| {
                            Error::Communication(format!("invalid Content-Length: {e}"))
                        })?;
                        content_length = Some(len);
                    }
                }
            }

            let Some(len) = content_length else {
                return Err(Error::Communication(
                    "frame header missing Content-Length".to_string(),
                ));
            };
            if len > MAX_FRAME_BYTES {
                return Err(Error::Communication(format!(
                    "frame of {len} bytes exceeds maximum {MAX_FRAME_BYTES}"
                )));
            }
            break;
        }
    }

    if let (Some(header_len), Some(content_len)) = (headers_end, content_length) {
        let total_len = header_len + content_len;

        if buffer.len() >= total_len {
            buffer.advance(header_len);
            let body_bytes = buffer.split_to(content_len);
            let body = String::from_utf8(body_bytes.to_vec())
                .map_err(|e| Error::Communication(format!("non-UTF-8 frame body: {e}")))?;
            return Ok(Some(body));
        }
    }

    Ok(None)
}
