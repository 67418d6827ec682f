//! Client events delivered to observers (UI, status persistence, logs).
//!
//! Events go out on a bounded `tokio::sync::broadcast` channel. A subscriber
//! that falls behind by more than the channel capacity receives
//! `RecvError::Lagged` and skips ahead; publishing never blocks the client.

use serde::Serialize;
use tokio::sync::broadcast;

/// Something observable happened to a server connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Handshake finished; the server is registered and usable.
    ServerConnected {
        server: String,
        tool_count: usize,
        resource_count: usize,
    },
    /// A connect attempt failed; nothing was registered.
    ConnectFailed { server: String, reason: String },
    /// The server was disconnected on request.
    ServerDisconnected { server: String },
    /// The server process went away on its own.
    ServerExited { server: String, reason: String },
    /// The server sent a notification.
    Notification {
        server: String,
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl ClientEvent {
    /// Name of the server this event concerns.
    pub fn server(&self) -> &str {
        match self {
            ClientEvent::ServerConnected { server, .. }
            | ClientEvent::ConnectFailed { server, .. }
            | ClientEvent::ServerDisconnected { server }
            | ClientEvent::ServerExited { server, .. }
            | ClientEvent::Notification { server, .. } => server,
        }
    }
}

/// Cloneable publishing side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}
