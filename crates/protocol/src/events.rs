//! Event fabric types
//!
//! Everything the daemon fans out to subscribers is an [`Event`]: a
//! monotonic sequence number, a UTC timestamp, the workspace it belongs to
//! (empty for global events) and a kind-specific payload. Events are
//! immutable once published.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number assigned by the hub at publish time.
    pub seq: u64,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// Workspace the event belongs to. Empty for global events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_id: String,
    #[serde(flatten)]
    pub payload: EventKind,
}

impl Event {
    /// Stable string name of this event's kind, used as the WS
    /// notification method suffix and in subscription filters.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Payload variants, tagged by `kind` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A new agent session started.
    SessionStart {
        session_id: String,
        mode: LaunchMode,
        cwd: String,
    },
    /// A log line (or raw PTY chunk) from the agent.
    ClaudeLog {
        session_id: String,
        /// "jsonl" for parsed headless output, "pty" for raw terminal bytes.
        stream: String,
        content: String,
    },
    /// Session state transition, including process exit.
    ClaudeStatus {
        session_id: String,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The agent asked the user a question (AskUserQuestion tool).
    ClaudeWaiting {
        session_id: String,
        tool_use_id: String,
        question: Value,
    },
    /// The agent wants to run a tool and needs a permission decision.
    ClaudePermission {
        session_id: String,
        request_id: String,
        tool_use_id: String,
        tool_name: String,
        input: Value,
        description: String,
    },
    /// A watched file changed on disk.
    FileChanged {
        path: String,
        change: FileChangeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        modified_at: Option<String>,
    },
    /// Debounced repository diff after file activity.
    GitDiff { diff: String, truncated: bool },
    /// Indexer scan progress / completion.
    IndexProgress {
        scanned: u64,
        total_bytes: u64,
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// Pairing request state changed.
    PairingState {
        request_id: String,
        state: PairingState,
        remote_addr: String,
    },
}

impl EventKind {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::ClaudeLog { .. } => "claude_log",
            Self::ClaudeStatus { .. } => "claude_status",
            Self::ClaudeWaiting { .. } => "claude_waiting",
            Self::ClaudePermission { .. } => "claude_permission",
            Self::FileChanged { .. } => "file_changed",
            Self::GitDiff { .. } => "git_diff",
            Self::IndexProgress { .. } => "index_progress",
            Self::PairingState { .. } => "pairing_state",
        }
    }
}

/// How a session was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    New,
    Continue,
    Resume,
}

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    AwaitingUser,
    AwaitingPermission,
    Stopping,
    Exited,
}

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Create,
    Write,
    Remove,
    Rename,
}

/// Pairing request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A permission decision, as stored in session memory and sent to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// Delegate to the agent's own UI (timeout / no stored decision).
    Ask,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

/// Scope of a permission response from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionScope {
    /// Applies to this request only.
    Once,
    /// Remembered for the rest of the session.
    Session,
}

impl Default for DecisionScope {
    fn default() -> Self {
        Self::Once
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_json() {
        let event = Event {
            seq: 7,
            timestamp: "2026-08-01T00:00:00.000Z".into(),
            workspace_id: "ws1".into(),
            payload: EventKind::FileChanged {
                path: "src/lib.rs".into(),
                change: FileChangeKind::Write,
                modified_at: None,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "file_changed");
        assert_eq!(json["seq"], 7);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "file_changed");
        assert_eq!(back.workspace_id, "ws1");
    }

    #[test]
    fn global_events_omit_workspace_id() {
        let event = Event {
            seq: 1,
            timestamp: "2026-08-01T00:00:00.000Z".into(),
            workspace_id: String::new(),
            payload: EventKind::PairingState {
                request_id: "r1".into(),
                state: PairingState::Pending,
                remote_addr: "127.0.0.1".into(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("workspace_id").is_none());
    }

    #[test]
    fn permission_decision_wire_names() {
        assert_eq!(
            serde_json::to_value(PermissionDecision::Allow).unwrap(),
            "allow"
        );
        assert_eq!(PermissionDecision::Ask.as_str(), "ask");
    }
}
