//! JSON-RPC dispatcher for the WebSocket surface.
//!
//! A method registry maps names to handlers; notifications (requests
//! without an `id`) are executed but never answered.

use serde_json::{json, Value};
use tracing::debug;

use cdev_protocol::rpc::{self, RpcRequest, RpcResponse};
use cdev_protocol::{PermissionResponse, RespondRequest, RunClaudeRequest, SearchMode};

use crate::indexer::SearchOptions;
use crate::state::SharedState;

/// Dispatch one request. Returns `None` for notifications.
pub async fn dispatch(state: &SharedState, request: RpcRequest) -> Option<RpcResponse> {
    let id = request.id.clone();
    let is_notification = request.is_notification();

    let result = run_method(state, &request).await;
    if is_notification {
        if let Err((code, message)) = result {
            debug!(
                component = "rpc",
                event = "rpc.notification_failed",
                method = %request.method,
                code = code,
                message = %message,
                "Notification handler failed"
            );
        }
        return None;
    }

    Some(match result {
        Ok(value) => RpcResponse::result(id.unwrap_or(Value::Null), value),
        Err((code, message)) => RpcResponse::error(id, code, message),
    })
}

type MethodResult = Result<Value, (i64, String)>;

async fn run_method(state: &SharedState, request: &RpcRequest) -> MethodResult {
    let params = request.params.clone().unwrap_or(Value::Null);
    match request.method.as_str() {
        "status" => {
            let session = state.sessions.current();
            Ok(json!({
                "version": crate::VERSION,
                "repo": state.repo.to_string_lossy(),
                "workspace_id": state.workspace_id,
                "workspace_count": state.workspaces.len(),
                "session": session,
            }))
        }

        "run_claude" => {
            let request: RunClaudeRequest = parse_params(params)?;
            let info = state
                .sessions
                .run(request)
                .await
                .map_err(internal_error)?;
            Ok(json!({ "session_id": info.session_id }))
        }

        "stop_claude" => {
            state.sessions.stop().await.map_err(internal_error)?;
            Ok(json!({ "stopped": true }))
        }

        "respond_to_claude" => {
            let request: RespondRequest = parse_params(params)?;
            state
                .sessions
                .respond(&request.tool_use_id, &request.response, request.is_error)
                .await
                .map_err(internal_error)?;
            Ok(json!({ "ok": true }))
        }

        "respond_permission" => {
            let request: PermissionResponse = parse_params(params)?;
            let delivered =
                state
                    .bridge
                    .respond(&request.tool_use_id, request.decision, request.scope);
            Ok(json!({ "delivered": delivered }))
        }

        "list_pending_permissions" => {
            let pending = state.bridge.list_pending();
            serde_json::to_value(pending).map_err(|e| (rpc::INTERNAL_ERROR, e.to_string()))
        }

        "search_index" => {
            #[derive(serde::Deserialize)]
            struct Params {
                q: String,
                #[serde(default)]
                mode: Option<SearchMode>,
                #[serde(default)]
                limit: Option<usize>,
                #[serde(default)]
                offset: Option<usize>,
                #[serde(default)]
                include_binary: bool,
                #[serde(default)]
                include_sensitive: bool,
            }
            let p: Params = parse_params(params)?;
            let results = state
                .indexer
                .search(SearchOptions {
                    mode: p.mode.unwrap_or(SearchMode::Fuzzy),
                    query: p.q,
                    limit: p.limit.unwrap_or(50),
                    offset: p.offset.unwrap_or(0),
                    include_binary: p.include_binary,
                    include_sensitive: p.include_sensitive,
                })
                .await
                .map_err(internal_error)?;
            serde_json::to_value(results).map_err(|e| (rpc::INTERNAL_ERROR, e.to_string()))
        }

        "git_status" => {
            let output = state
                .git
                .status(&state.repo)
                .await
                .map_err(internal_error)?;
            Ok(json!({ "text": output.text, "truncated": output.truncated }))
        }

        "git_diff" => {
            #[derive(serde::Deserialize, Default)]
            struct Params {
                #[serde(default)]
                path: Option<String>,
            }
            let p: Params = if params.is_null() {
                Params::default()
            } else {
                parse_params(params)?
            };
            let output = state
                .git
                .diff(&state.repo, p.path.as_deref())
                .await
                .map_err(internal_error)?;
            Ok(json!({ "text": output.text, "truncated": output.truncated }))
        }

        other => Err((rpc::METHOD_NOT_FOUND, format!("unknown method: {other}"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, (i64, String)> {
    serde_json::from_value(params).map_err(|e| (rpc::INVALID_PARAMS, e.to_string()))
}

fn internal_error(err: impl std::fmt::Display) -> (i64, String) {
    (rpc::INTERNAL_ERROR, err.to_string())
}
