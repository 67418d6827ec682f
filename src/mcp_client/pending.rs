//! Pending-request table.
//!
//! Maps each in-flight request id to the caller waiting for it and to the
//! timer that will expire it. An entry is removed under the table lock by
//! whichever event gets there first (response, timeout, or connection
//! close) and only the remover fulfils the waiter, so every waiter is
//! completed exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::RequestId;

/// What a waiter eventually receives.
pub type Reply = Result<serde_json::Value, McpError>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Reply>,
    timer: JoinHandle<()>,
    registered_at: Instant,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<RequestId, PendingRequest>,
    /// Set once the connection is torn down; later registrations fail.
    closed: bool,
}

/// Per-connection map from request id to waiter plus expiry timer.
#[derive(Clone)]
pub struct PendingTable {
    server_name: Arc<str>,
    state: Arc<Mutex<TableState>>,
}

impl PendingTable {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: Arc::from(server_name),
            state: Arc::new(Mutex::new(TableState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id` that expires after `timeout`.
    ///
    /// Must be called before the request is written so that a fast response
    /// always finds its entry.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Reply>, McpError> {
        let mut state = self.lock();
        if state.closed {
            return Err(McpError::ConnectionClosed {
                name: self.server_name.to_string(),
            });
        }
        if state.entries.contains_key(&id) {
            return Err(McpError::ProtocolError {
                server: self.server_name.to_string(),
                reason: format!("request id {id} is already in flight"),
            });
        }

        let (tx, rx) = oneshot::channel();
        let timer = {
            let table = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                table.expire(&id, timeout);
            })
        };

        state.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
                timer,
                registered_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Fulfil the waiter for `id`. Returns `false` if no such entry is live
    /// (already fulfilled, expired, abandoned, or never registered).
    pub fn resolve(&self, id: &RequestId, reply: Reply) -> bool {
        let Some(entry) = self.lock().entries.remove(id) else {
            return false;
        };
        entry.timer.abort();
        tracing::debug!(
            server = %self.server_name,
            method = %entry.method,
            %id,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "request completed"
        );
        if entry.tx.send(reply).is_err() {
            tracing::debug!(server = %self.server_name, %id, "waiter went away before its reply");
        }
        true
    }

    /// Remove the entry for `id` without replying (the caller reports the
    /// failure itself, e.g. when the write never reached the server).
    pub fn abandon(&self, id: &RequestId) -> bool {
        match self.lock().entries.remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Reject every pending waiter with `ConnectionClosed` and refuse any
    /// further registrations. Returns how many waiters were rejected.
    pub fn close(&self) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().collect()
        };

        let count = drained.len();
        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(McpError::ConnectionClosed {
                name: self.server_name.to_string(),
            }));
        }
        if count > 0 {
            tracing::info!(server = %self.server_name, count, "rejected pending requests on close");
        }
        count
    }

    fn expire(&self, id: &RequestId, timeout: Duration) {
        let Some(entry) = self.lock().entries.remove(id) else {
            return;
        };
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(
            server = %self.server_name,
            method = %entry.method,
            %id,
            timeout_ms,
            "request timed out"
        );
        let _ = entry.tx.send(Err(McpError::Timeout {
            method: entry.method,
            timeout_ms,
        }));
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
