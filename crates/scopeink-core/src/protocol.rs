//! Wire protocol between `RelayDocumentStore` and the relay server.
//!
//! Messages are JSON text frames tagged by `type`.

use crate::docstore::{DocChange, DocWrite};
use crate::ids::OpId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start streaming documents under `prefix`
    Subscribe { sub_id: u64, prefix: String },
    /// Stop a subscription
    Unsubscribe { sub_id: u64 },
    /// Write one document; `value: null` deletes it
    Write {
        path: String,
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_id: Option<OpId>,
    },
}

impl From<DocWrite> for ClientMessage {
    fn from(write: DocWrite) -> Self {
        ClientMessage::Write {
            path: write.path,
            value: write.value,
            op_id: write.op_id,
        }
    }
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current documents for a new subscription
    Snapshot { sub_id: u64, changes: Vec<DocChange> },
    /// A document changed under one of the connection's subscriptions
    Change {
        path: String,
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_id: Option<OpId>,
    },
    /// A write was persisted
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_id: Option<OpId>,
        /// The op id had already been applied; nothing changed
        #[serde(default)]
        duplicate: bool,
    },
    /// Error message
    Error { message: String },
}

impl ServerMessage {
    /// Convert a `Change` into the subscriber-facing form.
    pub fn into_change(self) -> Option<DocChange> {
        match self {
            ServerMessage::Change { path, value, op_id } => Some(DocChange { path, value, op_id }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_serialize() {
        let msg = ClientMessage::Subscribe {
            sub_id: 3,
            prefix: "projects/p/shapes/".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["sub_id"], 3);
    }

    #[test]
    fn test_delete_write_keeps_null_value() {
        let msg = ClientMessage::Write {
            path: "projects/p/shapes/s".to_string(),
            value: None,
            op_id: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"value\":null"));
        let back: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_server_message_deserialize() {
        let json = r#"{"type":"change","path":"projects/p/locks/s","value":{"a":1}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let change = msg.into_change().unwrap();
        assert_eq!(change.path, "projects/p/locks/s");
        assert_eq!(change.value, Some(json!({"a": 1})));
        assert!(change.op_id.is_none());
    }

    #[test]
    fn test_ack_duplicate_defaults_false() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Ack {
                op_id: None,
                duplicate: false
            }
        );
    }
}
