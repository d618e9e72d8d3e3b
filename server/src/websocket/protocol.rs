//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names.

use branchsync_engine::{Record, StateChange, SyncOutcome};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the current records.
    List {
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Ask for a manual sync.
    Sync {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Pushed to every client whenever records or sync status change.
    StateChanged { change: StateChange },

    /// Response to a list request.
    Branches {
        records: Vec<Record>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to a sync request.
    SyncResult {
        outcome: SyncOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn state_changed(change: StateChange) -> Self {
        ServerMessage::StateChanged { change }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_engine::ConnectivityState;
    use serde_json::json;

    #[test]
    fn test_client_message_deserialization() {
        let json = r#"{"type": "list", "request_id": "req-1"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::List { request_id: Some(id) } if id == "req-1"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "sync"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Sync { request_id: None }));

        let json = r#"{"type": "ping"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "push"}"#).is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Pong;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::error("test error", Some("req-1".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"test error""#));
        assert!(json.contains(r#""request_id":"req-1""#));
    }

    #[test]
    fn state_changed_carries_the_change() {
        let msg = ServerMessage::state_changed(StateChange::Connectivity {
            state: ConnectivityState::Offline,
        });
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "state_changed");
        assert_eq!(value["change"]["kind"], "connectivity");

        let msg = ServerMessage::SyncResult {
            outcome: SyncOutcome::NothingToSync,
            request_id: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "sync_result", "outcome": "nothing_to_sync"})
        );
    }
}
