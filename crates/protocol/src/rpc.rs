//! JSON-RPC 2.0 envelope carried over the WebSocket.
//!
//! Clients send [`RpcRequest`]s; the daemon replies with [`RpcResponse`]s
//! and pushes unsolicited notifications whose `method` is
//! `"event/" + kind` and whose `params` carry the event payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Event;

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// An incoming JSON-RPC request. Requests without an `id` are
/// notifications: the dispatcher runs them but never replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An outgoing JSON-RPC response or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Set on notifications only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            result: Some(result),
            error: None,
            method: None,
            params: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            method: None,
            params: None,
        }
    }

    /// Build an unsolicited notification from a published event.
    pub fn notification(event: &Event) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            result: None,
            error: None,
            method: Some(format!("event/{}", event.kind())),
            params: serde_json::to_value(event).ok(),
        }
    }
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, PairingState};

    #[test]
    fn request_without_id_is_notification() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"status"}"#).unwrap();
        assert!(req.is_notification());

        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"method":"status"}"#).unwrap();
        assert!(!req.is_notification());
    }

    #[test]
    fn notification_method_encodes_event_kind() {
        let event = Event {
            seq: 1,
            timestamp: "2026-08-01T00:00:00.000Z".into(),
            workspace_id: String::new(),
            payload: EventKind::PairingState {
                request_id: "r1".into(),
                state: PairingState::Approved,
                remote_addr: "10.0.0.1".into(),
            },
        };
        let note = RpcResponse::notification(&event);
        assert_eq!(note.method.as_deref(), Some("event/pairing_state"));
        assert!(note.id.is_none());
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::error(Some(1.into()), METHOD_NOT_FOUND, "no such method");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }
}
