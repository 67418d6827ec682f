//! One live server: process, transport, state machine, and discovery cache.
//!
//! State flow:
//! `Disconnected -> Connecting -> Handshaking -> Ready -> Disconnecting -> Disconnected`.
//! `Error` is absorbing and is entered when spawn or handshake fails or the
//! stdout stream violates framing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::ClientOptions;
use super::errors::McpError;
use super::events::EventSink;
use super::lifecycle::{self, StderrTail};
use super::transport::{read_loop, ReadOutcome, StdioTransport};
use super::types::{
    Implementation, InitializeParams, InitializeResult, McpResource, McpTool,
    ResourcesListResult, ServerConfig, ToolsListResult, MCP_PROTOCOL_VERSION,
};

// ─── ConnectionState ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Disconnecting,
    Error,
}

impl ConnectionState {
    /// No further transitions happen on their own from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the handshake and resource discovery learned about the server.
#[derive(Default)]
struct Catalog {
    init: InitializeResult,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
}

// ─── ServerConnection ────────────────────────────────────────────────────────

pub struct ServerConnection {
    config: ServerConfig,
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    transport: Arc<StdioTransport>,
    catalog: RwLock<Catalog>,
    /// Taken by whichever teardown path reaps the process.
    child: tokio::sync::Mutex<Option<Child>>,
    stderr: StderrTail,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set once a deliberate teardown (disconnect or failed connect) starts.
    shutting_down: AtomicBool,
    exit_reason: Mutex<Option<String>>,
}

impl ServerConnection {
    /// Spawn the server and run the handshake.
    ///
    /// Only returns a connection that reached `Ready`. On failure the
    /// process has already been killed.
    pub async fn connect(
        config: ServerConfig,
        options: ClientOptions,
        events: EventSink,
    ) -> Result<Arc<Self>, McpError> {
        tracing::info!(server = %config.name, command = %config.command, "connecting");

        let spawned = lifecycle::spawn_process(&config, &options).await?;
        let transport = Arc::new(StdioTransport::new(&config.name, spawned.stdin, events));
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let conn = Arc::new(Self {
            config,
            options,
            state,
            transport: Arc::clone(&transport),
            catalog: RwLock::new(Catalog::default()),
            child: tokio::sync::Mutex::new(Some(spawned.child)),
            stderr: spawned.stderr,
            reader: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            exit_reason: Mutex::new(None),
        });

        // The reader only holds a weak handle so dropping the connection
        // drops the child (kill_on_drop) and ends the loop.
        let weak = Arc::downgrade(&conn);
        let max_line_bytes = conn.options.max_line_bytes;
        let reader = tokio::spawn(async move {
            let outcome = read_loop(transport, spawned.stdout, max_line_bytes).await;
            if let Some(conn) = weak.upgrade() {
                conn.on_reader_stopped(outcome).await;
            }
        });
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);

        conn.transition(ConnectionState::Handshaking);
        let handshake = tokio::time::timeout(conn.options.handshake_timeout, conn.handshake()).await;
        let failure = match handshake {
            Ok(Ok(())) => conn.discover_resources().await.err().map(|e| e.to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "handshake timed out after {}ms",
                conn.options.handshake_timeout.as_millis()
            )),
        };

        if let Some(reason) = failure {
            conn.abort_connect().await;
            let reason = format!("{reason}{}", lifecycle::format_stderr_suffix(&conn.stderr.drain().await));
            tracing::warn!(server = %conn.config.name, reason = %reason, "handshake failed");
            return Err(McpError::HandshakeFailed {
                name: conn.config.name.clone(),
                reason,
            });
        }

        conn.transition(ConnectionState::Ready);
        tracing::info!(
            server = %conn.config.name,
            tools = conn.tools().len(),
            resources = conn.resources().len(),
            "server ready"
        );
        Ok(conn)
    }

    /// `initialize` -> `initialized` -> `tools/list`.
    async fn handshake(&self) -> Result<(), McpError> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({ "tools": {}, "resources": {}, "prompts": {} }),
            client_info: Implementation {
                name: self.options.client_name.clone(),
                version: self.options.client_version.clone(),
            },
        };
        let params = serde_json::to_value(params).map_err(|e| self.protocol_error(e))?;

        let result = self.raw_request("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| self.protocol_error(e))?;
        if let Some(version) = &init.protocol_version {
            if version != MCP_PROTOCOL_VERSION {
                tracing::warn!(
                    server = %self.config.name,
                    server_version = %version,
                    client_version = MCP_PROTOCOL_VERSION,
                    "server negotiated a different protocol version"
                );
            }
        }

        self.transport
            .notify("initialized", Some(serde_json::json!({})))
            .await?;

        let result = self.raw_request("tools/list", None).await?;
        let tools: ToolsListResult =
            serde_json::from_value(result).map_err(|e| self.protocol_error(e))?;

        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        catalog.init = init;
        catalog.tools = tools.tools;
        Ok(())
    }

    /// Best-effort `resources/list` on its own budget.
    ///
    /// Only a dead connection is an error. Anything else leaves the resource
    /// list empty.
    async fn discover_resources(&self) -> Result<(), McpError> {
        let budget = self.options.discovery_timeout;
        let resources = match self.transport.request("resources/list", None, budget).await {
            Ok(result) => match serde_json::from_value::<ResourcesListResult>(result) {
                Ok(list) => list.resources,
                Err(e) => {
                    tracing::warn!(server = %self.config.name, error = %e, "unparseable resources/list result");
                    Vec::new()
                }
            },
            Err(e) if e.is_connection_closed() => return Err(e),
            Err(e) => {
                tracing::info!(server = %self.config.name, error = %e, "resources/list unavailable");
                Vec::new()
            }
        };

        self.catalog.write().unwrap_or_else(PoisonError::into_inner).resources = resources;
        Ok(())
    }

    async fn raw_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.transport
            .request(method, params, self.options.request_timeout)
            .await
    }

    fn protocol_error(&self, e: impl std::fmt::Display) -> McpError {
        McpError::ProtocolError {
            server: self.config.name.clone(),
            reason: e.to_string(),
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────────

    /// Send a request using the default request timeout.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.send_request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_ready()?;
        self.transport.request(method, params, timeout).await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_ready()?;
        self.transport.notify(method, params).await
    }

    /// `tools/call` with `{name, arguments}`.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        self.send_request_with_timeout("tools/call", Some(params), timeout)
            .await
    }

    /// `resources/read` with `{uri}`.
    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({ "uri": uri });
        self.send_request("resources/read", Some(params)).await
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        if self.state() == ConnectionState::Ready {
            Ok(())
        } else {
            Err(McpError::ConnectionClosed {
                name: self.config.name.clone(),
            })
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────────

    /// Close stdin, stop the process, reject everything still pending.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return;
        }
        tracing::info!(server = %self.config.name, "disconnecting");
        self.transition(ConnectionState::Disconnecting);
        self.teardown().await;
        self.transition(ConnectionState::Disconnected);
    }

    /// Failed spawn/handshake path: kill without ceremony and park in `Error`.
    async fn abort_connect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::Error);
        self.transport.pending().close();
        self.transport.close_writer().await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.config.name, error = %e, "kill after failed handshake");
            }
        }
        self.stop_reader();
    }

    async fn teardown(&self) {
        self.transport.pending().close();
        self.transport.close_writer().await;
        if let Some(mut child) = self.child.lock().await.take() {
            lifecycle::terminate(&mut child, &self.config.name, self.options.shutdown_grace).await;
        }
        self.stop_reader();
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
    }

    /// stdout ended without anyone asking: the process died or broke framing.
    async fn on_reader_stopped(&self, outcome: ReadOutcome) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        // Let stderr catch up so the reason carries the crash output.
        let stderr = self.stderr.drain().await;
        let reason = format!("{outcome}{}", lifecycle::format_stderr_suffix(&stderr));
        let next = match outcome {
            ReadOutcome::Overflow(_) => {
                tracing::error!(server = %self.config.name, reason = %reason, "dropping connection after protocol violation");
                ConnectionState::Error
            }
            ReadOutcome::Eof | ReadOutcome::Io(_) => {
                tracing::warn!(server = %self.config.name, reason = %reason, "server exited unexpectedly");
                ConnectionState::Disconnected
            }
        };
        *self.exit_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);

        self.transport.pending().close();
        self.transport.close_writer().await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Some(status) =
                lifecycle::terminate(&mut child, &self.config.name, self.options.shutdown_grace).await
            {
                tracing::info!(server = %self.config.name, %status, "reaped server process");
            }
        }
        self.transition(next);
    }

    // ─── State ───────────────────────────────────────────────────────────────

    /// Move to `next` unless the connection is already in `Error`.
    fn transition(&self, next: ConnectionState) {
        let name = &self.config.name;
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Error {
                return false;
            }
            tracing::debug!(server = %name, from = %current, to = %next, "state change");
            *current = next;
            true
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the connection reaches `Disconnected` or `Error`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Why the connection ended on its own, if it did.
    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─── Discovery cache ─────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tools
            .clone()
    }

    pub fn resources(&self) -> Vec<McpResource> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .clone()
    }

    /// The server's `initialize` result.
    pub fn server_info(&self) -> InitializeResult {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .init
            .clone()
    }

    /// Requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.transport.pending().len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
        assert!(!ConnectionState::Ready.is_terminal());
        assert!(!ConnectionState::Disconnecting.is_terminal());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Handshaking).unwrap(),
            "handshaking"
        );
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_before_handshake() {
        let config = ServerConfig::new("nope", "/nonexistent/mcp-hub-server");
        let err = ServerConnection::connect(config, ClientOptions::default(), EventSink::new(4))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_server_fails_handshake_and_is_killed() {
        // Reads stdin forever and never answers.
        let config = ServerConfig::new("mute", "sh").with_args(["-c", "while read -r line; do :; done"]);
        let options = ClientOptions::default()
            .with_spawn_grace(Duration::from_millis(50))
            .with_handshake_timeout(Duration::from_millis(200));

        let err = ServerConnection::connect(config, options, EventSink::new(4))
            .await
            .err()
            .unwrap();
        match err {
            McpError::HandshakeFailed { name, reason } => {
                assert_eq!(name, "mute");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("expected HandshakeFailed, got {other:?}"),
        }
    }
}
