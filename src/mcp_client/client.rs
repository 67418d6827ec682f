//! MCP Client — the server registry.
//!
//! Owns the name → connection map and is the only surface callers use:
//! connect / disconnect servers, call tools, read resources, and query the
//! discovery cache. Connections are inserted only once they reach `Ready`
//! and are removed before they are torn down, so a lookup never hands out
//! a connection that is mid-teardown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;

use super::config::{ClientOptions, McpConfigFile};
use super::connection::{ConnectionState, ServerConnection};
use super::errors::McpError;
use super::events::{ClientEvent, EventSink};
use super::status::{ServerStatus, ServerStatusRecord, ServerStatusStore};
use super::types::{InitializeResult, McpResource, McpTool, ServerConfig};

// ─── Shared State ────────────────────────────────────────────────────────────

struct Shared {
    servers: RwLock<HashMap<String, Arc<ServerConnection>>>,
    /// Names with a connect attempt in flight.
    connecting: Mutex<HashSet<String>>,
    events: EventSink,
    status: Option<Arc<dyn ServerStatusStore>>,
}

impl Shared {
    fn lookup(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remove(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Remove `conn` only if it is still the mapped connection for its name.
    fn remove_exact(&self, conn: &Arc<ServerConnection>) -> bool {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        match servers.get(conn.name()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                servers.remove(conn.name());
                true
            }
            _ => false,
        }
    }

    fn record_status(&self, config: &ServerConfig, status: ServerStatus, last_error: Option<String>) {
        let Some(store) = &self.status else {
            return;
        };
        let record = ServerStatusRecord::from_config(config, status, last_error);
        if let Err(e) = store.record(&record) {
            tracing::warn!(server = %config.name, error = %e, "failed to persist server status");
        }
    }

    /// A connection reached a terminal state without being asked to.
    fn handle_exit(&self, conn: &Arc<ServerConnection>) {
        if !self.remove_exact(conn) {
            // Disconnected deliberately; the disconnect path reports it.
            return;
        }
        let reason = conn
            .exit_reason()
            .unwrap_or_else(|| format!("connection ended ({})", conn.state()));
        tracing::warn!(server = %conn.name(), reason = %reason, "server removed after unexpected exit");
        self.record_status(conn.config(), ServerStatus::Disconnected, Some(reason.clone()));
        self.events.emit(ClientEvent::ServerExited {
            server: conn.name().to_string(),
            reason,
        });
    }
}

/// Clears a name from the in-flight set however the connect attempt ends.
struct ConnectingGuard {
    shared: Arc<Shared>,
    name: String,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.shared
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Registry of live MCP server connections. Cheap to clone; clones share
/// the same servers.
#[derive(Clone)]
pub struct McpClient {
    shared: Arc<Shared>,
    options: ClientOptions,
}

impl McpClient {
    pub fn new(options: ClientOptions) -> Self {
        Self::build(options, None)
    }

    /// Create a client that reports status changes to `store`.
    pub fn with_status_store(options: ClientOptions, store: Arc<dyn ServerStatusStore>) -> Self {
        Self::build(options, Some(store))
    }

    fn build(options: ClientOptions, status: Option<Arc<dyn ServerStatusStore>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                servers: RwLock::new(HashMap::new()),
                connecting: Mutex::new(HashSet::new()),
                events: EventSink::new(options.event_capacity),
                status,
            }),
            options,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Receive `ClientEvent`s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server, run the handshake, and register it.
    ///
    /// Fails with `AlreadyConnected` if the name is connected or already
    /// connecting. Nothing is registered unless the handshake completes.
    pub async fn connect_to_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let name = config.name.clone();
        let guard = self.reserve(&name)?;

        let result = ServerConnection::connect(
            config.clone(),
            self.options.clone(),
            self.shared.events.clone(),
        )
        .await;

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "failed to connect");
                self.shared
                    .record_status(&config, ServerStatus::Error, Some(e.to_string()));
                self.shared.events.emit(ClientEvent::ConnectFailed {
                    server: name,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.shared
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&conn));
        drop(guard);
        self.watch_for_exit(&conn);

        self.shared
            .record_status(&config, ServerStatus::Connected, None);
        self.shared.events.emit(ClientEvent::ServerConnected {
            server: name,
            tool_count: conn.tools().len(),
            resource_count: conn.resources().len(),
        });
        Ok(())
    }

    fn reserve(&self, name: &str) -> Result<ConnectingGuard, McpError> {
        let mut connecting = self
            .shared
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if connecting.contains(name) || self.shared.lookup(name).is_some() {
            return Err(McpError::AlreadyConnected {
                name: name.to_string(),
            });
        }
        connecting.insert(name.to_string());
        Ok(ConnectingGuard {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        })
    }

    /// Remove the entry when the connection dies on its own.
    fn watch_for_exit(&self, conn: &Arc<ServerConnection>) {
        let mut state = conn.watch_state();
        let conn = Arc::downgrade(conn);
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            if state.wait_for(|s| s.is_terminal()).await.is_err() {
                return;
            }
            if let (Some(shared), Some(conn)) = (shared.upgrade(), conn.upgrade()) {
                shared.handle_exit(&conn);
            }
        });
    }

    /// Disconnect and unregister `name`. No-op if it is not connected.
    pub async fn disconnect_from_server(&self, name: &str) {
        let Some(conn) = self.shared.remove(name) else {
            tracing::debug!(server = name, "disconnect requested for unknown server");
            return;
        };
        self.finish_disconnect(conn).await;
    }

    async fn finish_disconnect(&self, conn: Arc<ServerConnection>) {
        conn.disconnect().await;
        self.shared
            .record_status(conn.config(), ServerStatus::Disconnected, None);
        self.shared.events.emit(ClientEvent::ServerDisconnected {
            server: conn.name().to_string(),
        });
    }

    /// Connect every enabled server in `config` concurrently.
    ///
    /// Returns the servers that failed; the rest are connected.
    pub async fn connect_all(&self, config: &McpConfigFile) -> Vec<(String, McpError)> {
        let attempts = config.enabled_servers().into_iter().map(|server| async move {
            let name = server.name.clone();
            self.connect_to_server(server).await.err().map(|e| (name, e))
        });
        let failures: Vec<(String, McpError)> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();

        tracing::info!(
            connected = self.connected_servers().len(),
            failed = failures.len(),
            "connected configured servers"
        );
        failures
    }

    /// Disconnect everything concurrently. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let drained: Vec<Arc<ServerConnection>> = self
            .shared
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!(count = drained.len(), "disconnecting all servers");
        futures::future::join_all(drained.into_iter().map(|conn| self.finish_disconnect(conn))).await;
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn get(&self, server: &str) -> Result<Arc<ServerConnection>, McpError> {
        self.shared.lookup(server).ok_or_else(|| McpError::NotConnected {
            name: server.to_string(),
        })
    }

    /// Invoke `tool` on `server` with the default request timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.call_tool_with_timeout(server, tool, arguments, self.options.request_timeout)
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let conn = self.get(server)?;
        tracing::debug!(server, tool, "calling tool");
        conn.call_tool(tool, arguments, timeout).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<serde_json::Value, McpError> {
        self.get(server)?.read_resource(uri).await
    }

    /// Send an arbitrary request to `server`.
    pub async fn send_request(
        &self,
        server: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.get(server)?.send_request(method, params).await
    }

    pub async fn send_notification(
        &self,
        server: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.get(server)?.send_notification(method, params).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// The live connection for `server`, for per-connection operations.
    pub fn connection(&self, server: &str) -> Option<Arc<ServerConnection>> {
        self.shared.lookup(server)
    }

    /// Cached tools of `server` (empty if not connected).
    pub fn get_server_tools(&self, server: &str) -> Vec<McpTool> {
        self.shared
            .lookup(server)
            .map(|c| c.tools())
            .unwrap_or_default()
    }

    /// Cached resources of `server` (empty if not connected).
    pub fn get_server_resources(&self, server: &str) -> Vec<McpResource> {
        self.shared
            .lookup(server)
            .map(|c| c.resources())
            .unwrap_or_default()
    }

    /// Cached tools of every connected server, keyed by server name.
    pub fn get_all_tools(&self) -> HashMap<String, Vec<McpTool>> {
        self.shared
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, conn)| (name.clone(), conn.tools()))
            .collect()
    }

    /// Names of connected servers, sorted.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_connected(&self, server: &str) -> bool {
        self.shared.lookup(server).is_some()
    }

    pub fn server_state(&self, server: &str) -> Option<ConnectionState> {
        self.shared.lookup(server).map(|c| c.state())
    }

    /// The server's `initialize` result.
    pub fn server_info(&self, server: &str) -> Option<InitializeResult> {
        self.shared.lookup(server).map(|c| c.server_info())
    }

    /// Last recorded status of every server the store knows about.
    pub fn server_statuses(&self) -> Result<Vec<ServerStatusRecord>, McpError> {
        match &self.shared.status {
            Some(store) => store.all(),
            None => Ok(Vec::new()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
