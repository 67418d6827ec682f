//! Client tuning knobs and the on-disk server list.
//!
//! `ClientOptions` is code-level configuration handed to `McpClient::new`.
//! `McpConfigFile` is the user-editable `mcp_config.json` in the
//! Claude-Desktop layout:
//!
//! ```json
//! { "mcpServers": { "fs": { "command": "npx", "args": ["-y", "server-fs"] } } }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::codec::DEFAULT_MAX_LINE_BYTES;
use super::errors::McpError;
use super::types::ServerConfig;

/// File name of the server list inside the data directory.
pub const CONFIG_FILE_NAME: &str = "mcp_config.json";

// ─── ClientOptions ───────────────────────────────────────────────────────────

/// Timeouts and limits shared by every connection a client opens.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Default per-request timeout for `tools/call`, `resources/read`, etc.
    pub request_timeout: Duration,
    /// Bounds the required handshake steps (`initialize` through `tools/list`).
    pub handshake_timeout: Duration,
    /// Budget for the optional `resources/list` step. Running out leaves the
    /// resource list empty instead of failing the connect.
    pub discovery_timeout: Duration,
    /// A process that survives this long after spawn counts as started.
    pub spawn_grace: Duration,
    /// How long to wait after SIGTERM before force-killing.
    pub shutdown_grace: Duration,
    /// Largest stdout line accepted before the connection is dropped.
    pub max_line_bytes: usize,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Reported to servers as `clientInfo.name`.
    pub client_name: String,
    /// Reported to servers as `clientInfo.version`.
    pub client_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(5),
            spawn_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            event_capacity: 64,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_spawn_grace(mut self, grace: Duration) -> Self {
        self.spawn_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

// ─── McpConfigFile ───────────────────────────────────────────────────────────

/// One entry under `mcpServers`. The server's name is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled entries are kept in the file but never auto-connected.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl McpServerEntry {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            description: None,
            disabled: false,
        }
    }

    /// Build the launch recipe for `name`.
    pub fn to_server_config(&self, name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            description: Some(
                self.description
                    .clone()
                    .unwrap_or_else(|| format!("Auto-loaded MCP server: {name}")),
            ),
        }
    }
}

impl From<&ServerConfig> for McpServerEntry {
    fn from(config: &ServerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            description: config.description.clone(),
            disabled: false,
        }
    }
}

/// Contents of `mcp_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfigFile {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

impl McpConfigFile {
    /// `<data dir>/mcp_config.json`.
    pub fn default_path() -> PathBuf {
        crate::data_dir().join(CONFIG_FILE_NAME)
    }

    /// Load the config at `path`.
    ///
    /// A missing file is not an error: an empty config is written in its
    /// place and returned. A file that exists but does not parse is.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "created empty MCP config");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content).map_err(|e| McpError::ConfigError {
            reason: format!("{}: {e}", path.display()),
        })?;
        tracing::info!(
            path = %path.display(),
            servers = config.mcp_servers.len(),
            "loaded MCP config"
        );
        Ok(config)
    }

    /// Save as pretty JSON (write to a temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), McpError> {
        let content = self.export_json()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(path = %path.display(), "saved MCP config");
        Ok(())
    }

    /// Insert or replace a server entry.
    pub fn add_server(&mut self, name: &str, entry: McpServerEntry) -> Result<(), McpError> {
        validate_entry(name, &entry)?;
        if self.mcp_servers.insert(name.to_string(), entry).is_some() {
            tracing::info!(server = name, "replaced MCP server entry");
        }
        Ok(())
    }

    /// Remove a server entry, returning it if it existed.
    pub fn remove_server(&mut self, name: &str) -> Option<McpServerEntry> {
        self.mcp_servers.remove(name)
    }

    /// Merge servers from a JSON document in the same layout.
    ///
    /// The document is validated as a whole before anything is merged;
    /// imported entries replace existing ones of the same name. Returns the
    /// imported names in order.
    pub fn import_json(&mut self, json: &str) -> Result<Vec<String>, McpError> {
        let imported = Self::parse(json)?;
        let names: Vec<String> = imported.mcp_servers.keys().cloned().collect();
        self.mcp_servers.extend(imported.mcp_servers);
        Ok(names)
    }

    /// Pretty-printed JSON of the whole file.
    pub fn export_json(&self) -> Result<String, McpError> {
        serde_json::to_string_pretty(self).map_err(|e| McpError::ConfigError {
            reason: format!("failed to serialize MCP config: {e}"),
        })
    }

    /// Launch recipes for every entry not marked `disabled`, sorted by name.
    pub fn enabled_servers(&self) -> Vec<ServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|(_, entry)| !entry.disabled)
            .map(|(name, entry)| entry.to_server_config(name))
            .collect()
    }

    fn parse(json: &str) -> Result<Self, McpError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| McpError::ConfigError {
                reason: format!("invalid JSON: {e}"),
            })?;
        if value.get("mcpServers").map_or(true, |v| !v.is_object()) {
            return Err(McpError::ConfigError {
                reason: "missing \"mcpServers\" object".into(),
            });
        }
        let config: Self = serde_json::from_value(value).map_err(|e| McpError::ConfigError {
            reason: format!("invalid server entry: {e}"),
        })?;
        for (name, entry) in &config.mcp_servers {
            validate_entry(name, entry)?;
        }
        Ok(config)
    }
}

fn validate_entry(name: &str, entry: &McpServerEntry) -> Result<(), McpError> {
    if name.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: "server name must not be empty".into(),
        });
    }
    if entry.command.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: format!("server '{name}' has an empty command"),
        });
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
