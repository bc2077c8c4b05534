//! cdev Protocol
//!
//! Shared types for communication between the cdev daemon and its clients.
//! These types are serialized as JSON over the REST API and the WebSocket.

use uuid::Uuid;

pub mod events;
pub mod rest;
pub mod rpc;

pub use events::*;
pub use rest::*;
pub use rpc::{RpcError, RpcRequest, RpcResponse};

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 UTC timestamp
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
