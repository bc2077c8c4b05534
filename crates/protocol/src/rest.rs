//! REST DTOs and the hook wire contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{DecisionScope, LaunchMode, PermissionDecision, SessionState};

// ---------------------------------------------------------------------------
// Session control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunClaudeRequest {
    pub prompt: String,
    #[serde(default = "default_mode")]
    pub mode: LaunchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Extra CLI arguments merged with the fixed set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

fn default_mode() -> LaunchMode {
    LaunchMode::New
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunClaudeResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondRequest {
    pub tool_use_id: String,
    pub response: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Historical or active session as returned by `GET /api/claude/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub workspace_id: String,
    pub cwd: String,
    pub mode: LaunchMode,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub version: String,
    pub repo: String,
    pub connected_clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Pairing / auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairInfoResponse {
    pub ws: String,
    pub http: String,
    pub session: Option<String>,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairExchangeRequest {
    pub pairing_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// RFC 3339 expiry of the access token.
    pub expires_at: String,
    pub device_id: String,
}

// ---------------------------------------------------------------------------
// Permission hook contract
// ---------------------------------------------------------------------------

/// What the coding agent pipes to the hook binary on stdin, forwarded
/// verbatim to `POST /api/hooks/permission-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInput {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    pub tool_use_id: String,
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
}

/// What the hook binary must print to stdout.
///
/// The agent only understands the nested `hookSpecificOutput` object, so
/// field names here follow the external CLI's camelCase contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookOutput {
    #[serde(rename = "hookSpecificOutput")]
    pub hook_specific_output: HookSpecificOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,
    #[serde(rename = "permissionDecision")]
    pub permission_decision: PermissionDecision,
    #[serde(
        rename = "permissionDecisionReason",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision_reason: Option<String>,
}

impl HookOutput {
    pub fn decision(decision: PermissionDecision, reason: Option<String>) -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PreToolUse".to_string(),
                permission_decision: decision,
                permission_decision_reason: reason,
            },
        }
    }
}

/// Client response to a `claude_permission` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub tool_use_id: String,
    pub decision: PermissionDecision,
    #[serde(default)]
    pub scope: DecisionScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A pending permission prompt, for reconnecting clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPermission {
    pub request_id: String,
    pub session_id: String,
    pub workspace_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub description: String,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Indexer / files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Fuzzy,
    Exact,
    Prefix,
    Extension,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    pub name: String,
    pub directory: String,
    pub size: i64,
    pub modified_at: i64,
    pub is_binary: bool,
    pub is_sensitive: bool,
    pub git_tracked: bool,
    pub git_ignored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub file_count: i64,
    pub total_size: i64,
    pub binary_count: i64,
    pub sensitive_count: i64,
    pub largest_files: Vec<SearchResult>,
    pub last_scan_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUploadResponse {
    pub id: String,
    pub path: String,
    pub bytes: u64,
    pub expires_at: String,
    /// True when the upload matched an existing image by content hash.
    pub deduplicated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_output_uses_cli_field_names() {
        let out = HookOutput::decision(PermissionDecision::Allow, None);
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(
            json["hookSpecificOutput"]["permissionDecision"],
            "allow"
        );
        assert_eq!(json["hookSpecificOutput"]["hookEventName"], "PreToolUse");
    }

    #[test]
    fn run_request_defaults() {
        let req: RunClaudeRequest = serde_json::from_str(r#"{"prompt":"hello"}"#).unwrap();
        assert_eq!(req.mode, LaunchMode::New);
        assert!(req.args.is_empty());
        assert!(req.session_id.is_none());
    }

    #[test]
    fn permission_response_defaults_to_once() {
        let resp: PermissionResponse =
            serde_json::from_str(r#"{"tool_use_id":"t1","decision":"deny"}"#).unwrap();
        assert_eq!(resp.scope, DecisionScope::Once);
    }
}
