//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing request / notification envelopes to stdin (one line each)
//! - Running the stdout read loop that feeds the line codec
//! - Routing responses to the pending-request table and notifications to
//!   the event sink

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::codec::{encode_envelope, LineCodec, LineTooLong};
use super::errors::McpError;
use super::events::{ClientEvent, EventSink};
use super::pending::PendingTable;
use super::types::{
    error_codes, Envelope, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, ResponsePayload,
};

/// Size of each stdout read.
const READ_CHUNK_BYTES: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Write half of the connection plus the request bookkeeping shared with the
/// read loop.
pub struct StdioTransport {
    server_name: String,
    /// `None` once the write side has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    /// Per-connection request id counter.
    next_id: AtomicI64,
    pending: PendingTable,
    events: EventSink,
}

impl StdioTransport {
    /// Create a transport writing to `writer` (normally the child's stdin).
    pub fn new<W>(server_name: &str, writer: W, events: EventSink) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            next_id: AtomicI64::new(1),
            pending: PendingTable::new(server_name),
            events,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Allocate a fresh request id, unique for the lifetime of this transport.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request and wait for its response, a timeout, or connection close.
    ///
    /// Responses may arrive in any order relative to other in-flight requests;
    /// each caller only ever sees the reply matching its own id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_request_id();
        let rx = self.pending.register(id.clone(), method, timeout)?;

        let envelope = Envelope::Request(JsonRpcRequest::new(id.clone(), method, params));
        if let Err(e) = self.write_envelope(&envelope).await {
            self.pending.abandon(&id);
            return Err(e);
        }
        tracing::debug!(server = %self.server_name, method, %id, "request sent");

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(McpError::ConnectionClosed {
                name: self.server_name.clone(),
            }),
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let envelope = Envelope::Notification(JsonRpcNotification::new(method, params));
        self.write_envelope(&envelope).await
    }

    /// Encode and write one envelope with a single `write_all`.
    pub async fn write_envelope(&self, envelope: &Envelope) -> Result<(), McpError> {
        let bytes = encode_envelope(envelope).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize envelope: {e}"),
        })?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::ConnectionClosed {
            name: self.server_name.clone(),
        })?;

        writer
            .write_all(&bytes)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;
        Ok(())
    }

    /// Close the write side. The server sees EOF on its stdin.
    pub async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Route one inbound envelope.
    ///
    /// Never waits on stdin: replies to server requests go out from their
    /// own task so a server that stops reading cannot stall the read loop.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(&id, extract_result(response)) {
                    tracing::warn!(
                        server = %self.server_name,
                        %id,
                        "ignoring response with no pending request (late or duplicate)"
                    );
                }
            }
            Envelope::Notification(notification) => {
                tracing::debug!(
                    server = %self.server_name,
                    method = %notification.method,
                    "notification from server"
                );
                self.events.emit(ClientEvent::Notification {
                    server: self.server_name.clone(),
                    method: notification.method,
                    params: notification.params,
                });
            }
            Envelope::Request(request) => {
                let transport = Arc::clone(self);
                tokio::spawn(async move { transport.answer_server_request(request).await });
            }
        }
    }

    /// Servers may call back into the client. Only `ping` is supported.
    async fn answer_server_request(&self, request: JsonRpcRequest) {
        let response = if request.method == "ping" {
            JsonRpcResponse::success(request.id, serde_json::json!({}))
        } else {
            tracing::debug!(
                server = %self.server_name,
                method = %request.method,
                "rejecting unsupported server request"
            );
            JsonRpcResponse::failure(
                request.id,
                JsonRpcError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("Method not found: {}", request.method),
                    data: None,
                },
            )
        };

        if let Err(e) = self.write_envelope(&Envelope::Response(response)).await {
            tracing::debug!(server = %self.server_name, error = %e, "could not answer server request");
        }
    }
}

// ─── Read Loop ───────────────────────────────────────────────────────────────

/// Why the read loop stopped.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The server closed its stdout.
    Eof,
    /// Reading stdout failed.
    Io(String),
    /// The server sent a line longer than the accumulator allows.
    Overflow(LineTooLong),
}

impl std::fmt::Display for ReadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOutcome::Eof => write!(f, "stdout closed"),
            ReadOutcome::Io(e) => write!(f, "stdout read error: {e}"),
            ReadOutcome::Overflow(e) => write!(f, "{e}"),
        }
    }
}

/// Read stdout until EOF, dispatching each complete envelope in order.
pub async fn read_loop<R>(
    transport: Arc<StdioTransport>,
    mut reader: R,
    max_line_bytes: usize,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let mut codec = LineCodec::new(transport.server_name(), max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                if codec.pending_len() > 0 {
                    tracing::warn!(
                        server = %transport.server_name(),
                        bytes = codec.pending_len(),
                        "stdout closed mid-line; dropping partial envelope"
                    );
                }
                return ReadOutcome::Eof;
            }
            Ok(n) => match codec.decode(&chunk[..n]) {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        transport.dispatch(envelope);
                    }
                }
                Err(overflow) => {
                    tracing::error!(
                        server = %transport.server_name(),
                        limit = overflow.limit,
                        "server line exceeded the framing limit"
                    );
                    return ReadOutcome::Overflow(overflow);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Io(e.to_string()),
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    match response.payload {
        ResponsePayload::Result(value) => Ok(value),
        ResponsePayload::Error(err) => Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
