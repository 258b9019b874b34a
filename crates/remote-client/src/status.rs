//! Per-host connection status, broadcast to every interested caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ConfigStore;

pub const MSG_CONNECTING: &str = "We're establishing the connection. Please be patient";
pub const MSG_CONNECTED: &str = "The connection was established successfully";
pub const MSG_STARTING: &str = "Starting remote services";
pub const MSG_ACTIVE: &str = "Remote services are active";
pub const MSG_STOPPING: &str = "We're closing the connection. Please be patient";
pub const MSG_CLOSED: &str = "The connection was closed successfully";
pub const MSG_LOST: &str = "The connection was lost";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Inactive,
    Connecting,
    Connected,
    Starting,
    Active,
    Error,
    Stopping,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Inactive => "inactive",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Starting => "starting",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub status: ConnectionStatus,
    pub message: String,
}

/// Fans status changes out to subscribers and mirrors them into the
/// config store so a restarted frontend can show the last known state.
#[derive(Clone)]
pub struct StatusTracker {
    sender: broadcast::Sender<StatusEvent>,
    store: Option<Arc<ConfigStore>>,
    current: Arc<Mutex<HashMap<String, StatusEvent>>>,
}

impl StatusTracker {
    pub fn new(store: Option<Arc<ConfigStore>>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            store,
            current: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, id: &str, status: ConnectionStatus, message: impl Into<String>) {
        let event = StatusEvent {
            id: id.to_string(),
            status,
            message: message.into(),
        };
        debug!("[status] {} -> {} ({})", id, status, event.message);

        if let Some(store) = &self.store {
            if let Err(e) = store.set_status(id, status, &event.message) {
                warn!("[status] Failed to persist status for {}: {}", id, e);
            }
        }
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), event.clone());
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Last status emitted for `id`, if any.
    pub fn current(&self, id: &str) -> Option<StatusEvent> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        let parsed: ConnectionStatus = serde_json::from_str("\"stopping\"").unwrap();
        assert_eq!(parsed, ConnectionStatus::Stopping);
    }

    #[test]
    fn test_emit_reaches_subscribers_and_is_remembered() {
        let tracker = StatusTracker::new(None);
        let mut rx = tracker.subscribe();
        tracker.emit("h1", ConnectionStatus::Connecting, MSG_CONNECTING);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, "h1");
        assert_eq!(event.status, ConnectionStatus::Connecting);
        assert_eq!(tracker.current("h1").unwrap().message, MSG_CONNECTING);
        assert!(tracker.current("h2").is_none());
    }
}
