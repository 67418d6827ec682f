//! Line-delimited JSON-RPC framing.
//!
//! Every envelope is one compact JSON object followed by a single `\n`.
//! Stream reads arrive in arbitrary chunks, so [`LineCodec`] keeps the
//! trailing incomplete line between calls and only ever hands out envelopes
//! built from complete lines. A malformed line is logged and dropped; it
//! never poisons the carry-over buffer.

use serde_json::Value;
use thiserror::Error;

use super::types::{
    Envelope, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    ResponsePayload, JSONRPC_VERSION,
};

/// Default cap on a single unterminated line (8 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Why a single line could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported jsonrpc version: {0}")]
    Version(String),

    #[error("malformed envelope: {0}")]
    Shape(&'static str),
}

/// A line grew past the accumulator bound without a terminating newline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("line exceeds {limit} bytes without a newline")]
pub struct LineTooLong {
    pub limit: usize,
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize an envelope to compact JSON terminated by `\n`.
///
/// The caller writes the returned buffer with a single `write_all` so that
/// concurrent writers never interleave partial lines.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Parse one complete line (without its newline) into an envelope.
///
/// Classification: `method` + `id` is a request, `method` without `id` (or
/// with a null `id`) is a notification, `id` without `method` is a response
/// and must carry exactly one of `result` / `error`.
pub fn decode_envelope(line: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(line)?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::Shape("expected a JSON object"));
    };

    match map.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(DecodeError::Version(other.to_string())),
        None => return Err(DecodeError::Shape("missing jsonrpc field")),
    }

    let id = match map.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<RequestId>(raw.clone())?),
    };
    let has_method = map.contains_key("method");

    match (has_method, id) {
        (true, Some(_)) => {
            let request: JsonRpcRequest = serde_json::from_value(Value::Object(map))?;
            Ok(Envelope::Request(request))
        }
        (true, None) => {
            map.remove("id");
            let notification: JsonRpcNotification = serde_json::from_value(Value::Object(map))?;
            Ok(Envelope::Notification(notification))
        }
        (false, Some(id)) => {
            let payload = match (map.remove("result"), map.remove("error")) {
                (None | Some(Value::Null), Some(err)) if !err.is_null() => {
                    ResponsePayload::Error(serde_json::from_value::<JsonRpcError>(err)?)
                }
                (Some(result), None | Some(Value::Null)) => ResponsePayload::Result(result),
                (Some(_), Some(_)) => {
                    return Err(DecodeError::Shape("response carries both result and error"))
                }
                _ => return Err(DecodeError::Shape("response carries neither result nor error")),
            };
            Ok(Envelope::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                payload,
            }))
        }
        (false, None) => Err(DecodeError::Shape(
            "neither a request, a response nor a notification",
        )),
    }
}

/// Bounded carry-over accumulator that reassembles envelopes from chunks.
#[derive(Debug)]
pub struct LineCodec {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
    max_line_bytes: usize,
    /// Label used in diagnostics (the server name).
    label: String,
}

impl LineCodec {
    pub fn new(label: &str, max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_bytes,
            label: label.to_string(),
        }
    }

    /// Append a chunk and return every envelope it completes, in stream order.
    ///
    /// Lines that fail to parse are logged and skipped. Returns `LineTooLong`
    /// when a single line exceeds the bound; the buffer is cleared in that
    /// case and the stream should be considered unusable.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, LineTooLong> {
        self.buf.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            if end - start > self.max_line_bytes {
                return Err(self.overflow());
            }
            if let Some(envelope) = self.decode_line(start, end) {
                envelopes.push(envelope);
            }
            start = end + 1;
            search_from = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line_bytes {
            return Err(self.overflow());
        }
        Ok(envelopes)
    }

    /// Bytes currently held waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partially received line.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    fn decode_line(&self, start: usize, end: usize) -> Option<Envelope> {
        let mut line = &self.buf[start..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match decode_envelope(line) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(
                    server = %self.label,
                    error = %e,
                    line = %String::from_utf8_lossy(&line[..line.len().min(200)]),
                    "discarding unparsable line"
                );
                None
            }
        }
    }

    fn overflow(&mut self) -> LineTooLong {
        self.clear();
        LineTooLong {
            limit: self.max_line_bytes,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
