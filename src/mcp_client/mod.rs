//! MCP Client — JSON-RPC over stdio transport for MCP server management.
//!
//! This module handles:
//! - Spawning MCP server child processes and tearing them down
//! - Line-delimited JSON-RPC 2.0 framing over process stdio
//! - The initialize handshake and tool / resource discovery
//! - Routing tool calls and resource reads to the right server
//! - Reporting connection events and last-known server status
//!
//! `McpClient` is the entry point; everything else is plumbing it owns.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod pending;
pub mod status;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ClientOptions, McpConfigFile, McpServerEntry};
pub use connection::{ConnectionState, ServerConnection};
pub use errors::McpError;
pub use events::ClientEvent;
pub use status::{
    MemoryStatusStore, ServerStatus, ServerStatusRecord, ServerStatusStore, SqliteStatusStore,
};
pub use types::{InitializeResult, McpResource, McpTool, ServerConfig};
