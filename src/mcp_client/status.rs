//! Last-known server status, kept for UIs and the next startup.
//!
//! The registry reports every connect, failed connect, disconnect and
//! unexpected exit to a `ServerStatusStore`. Two stores are provided: an
//! in-memory map and a SQLite table (`mcp_servers`) using `rusqlite` in
//! synchronous mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connected,
    Disconnected,
    Error,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "connected" => ServerStatus::Connected,
            "error" => ServerStatus::Error,
            _ => ServerStatus::Disconnected,
        }
    }
}

/// One row of server status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusRecord {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServerStatusRecord {
    /// Snapshot `config` with the given outcome, stamped now.
    pub fn from_config(config: &ServerConfig, status: ServerStatus, last_error: Option<String>) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            status,
            last_error,
            updated_at: Utc::now(),
        }
    }
}

/// Where status records go. Implementations must be cheap enough to call
/// from async code.
pub trait ServerStatusStore: Send + Sync {
    /// Insert or replace the record for `record.name`.
    fn record(&self, record: &ServerStatusRecord) -> Result<(), McpError>;

    fn get(&self, name: &str) -> Result<Option<ServerStatusRecord>, McpError>;

    /// Every record, sorted by name.
    fn all(&self) -> Result<Vec<ServerStatusRecord>, McpError>;
}

// ─── MemoryStatusStore ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<String, ServerStatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ServerStatusRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerStatusStore for MemoryStatusStore {
    fn record(&self, record: &ServerStatusRecord) -> Result<(), McpError> {
        self.lock().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<ServerStatusRecord>, McpError> {
        Ok(self.lock().get(name).cloned())
    }

    fn all(&self) -> Result<Vec<ServerStatusRecord>, McpError> {
        Ok(self.lock().values().cloned().collect())
    }
}

// ─── SqliteStatusStore ───────────────────────────────────────────────────────

/// Status table in a SQLite database.
pub struct SqliteStatusStore {
    conn: Mutex<Connection>,
}

impl SqliteStatusStore {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, McpError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mcp_servers (
                name TEXT PRIMARY KEY,
                description TEXT,
                command TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                env TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const SELECT_COLUMNS: &str =
    "SELECT name, description, command, args, env, status, last_error, updated_at FROM mcp_servers";

impl ServerStatusStore for SqliteStatusStore {
    fn record(&self, record: &ServerStatusRecord) -> Result<(), McpError> {
        let args = serde_json::to_string(&record.args).map_err(persistence_error)?;
        let env = serde_json::to_string(&record.env).map_err(persistence_error)?;
        self.lock().execute(
            "INSERT INTO mcp_servers (name, description, command, args, env, status, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                command = excluded.command,
                args = excluded.args,
                env = excluded.env,
                status = excluded.status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                record.name,
                record.description,
                record.command,
                args,
                env,
                record.status.as_str(),
                record.last_error,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<ServerStatusRecord>, McpError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE name = ?1"),
                params![name],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn all(&self) -> Result<Vec<ServerStatusRecord>, McpError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServerStatusRecord> {
    let args: String = row.get(3)?;
    let env: String = row.get(4)?;
    let status: String = row.get(5)?;
    let updated_at: String = row.get(7)?;
    Ok(ServerStatusRecord {
        name: row.get(0)?,
        description: row.get(1)?,
        command: row.get(2)?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        env: serde_json::from_str(&env).unwrap_or_default(),
        status: ServerStatus::parse(&status),
        last_error: row.get(6)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn persistence_error(e: serde_json::Error) -> McpError {
    McpError::PersistenceError {
        reason: e.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
