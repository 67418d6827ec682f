//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start (or died inside the spawn grace period).
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The `initialize` / `tools/list` handshake failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// Writing to the server's stdin failed, or an envelope could not be encoded.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the request's deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The connection was torn down while the request was in flight.
    #[error("connection to server '{name}' closed")]
    ConnectionClosed {
        name: String,
    },

    /// No connection is registered under this server name.
    #[error("server '{name}' not connected")]
    NotConnected {
        name: String,
    },

    /// A connection (live or in progress) already exists under this name.
    #[error("server '{name}' is already connected")]
    AlreadyConnected {
        name: String,
    },

    /// The server violated the wire protocol (e.g. an unterminated line
    /// exceeding the accumulator bound, or an unparsable result payload).
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },

    /// Configuration error (bad config file, invalid server entry).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// The status store could not be read or written.
    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
    },
}

impl McpError {
    /// `true` for failures caused by addressing an unknown server name.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, McpError::NotConnected { .. })
    }

    /// `true` when the request expired waiting for its response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// `true` when the request was abandoned because the connection went away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, McpError::ConnectionClosed { .. })
    }

    /// `true` when the server answered with a JSON-RPC `error` object.
    pub fn is_server_error(&self) -> bool {
        matches!(self, McpError::ServerError { .. })
    }
}

impl From<rusqlite::Error> for McpError {
    fn from(e: rusqlite::Error) -> Self {
        McpError::PersistenceError {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::ConfigError {
            reason: e.to_string(),
        }
    }
}
