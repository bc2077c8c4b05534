//! REST handlers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use cdev_protocol::{
    HookInput, HookOutput, PairExchangeRequest, PairInfoResponse, PairRefreshRequest,
    PairingState, PermissionResponse, RespondRequest, RunClaudeRequest, RunClaudeResponse,
    SearchMode, StatusResponse, TokenPairResponse,
};

use crate::error::ApiError;
use crate::images::detect_format;
use crate::indexer::{ListOptions, SearchOptions, SortBy};
use crate::paths;
use crate::state::SharedState;
use crate::tokens::TokenType;
use crate::VERSION;

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

pub async fn status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        ok: true,
        version: VERSION.to_string(),
        repo: state.repo.to_string_lossy().into_owned(),
        connected_clients: state.connected_clients.load(Ordering::Relaxed),
        session: state.sessions.current(),
        index_error: state.indexer.error_message(),
    })
}

// ---------------------------------------------------------------------------
// Session control
// ---------------------------------------------------------------------------

pub async fn claude_run(
    State(state): State<SharedState>,
    Json(request): Json<RunClaudeRequest>,
) -> Result<Json<RunClaudeResponse>, ApiError> {
    let info = state.sessions.run(request).await?;
    Ok(Json(RunClaudeResponse {
        session_id: info.session_id,
    }))
}

pub async fn claude_stop(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    state.sessions.stop().await?;
    Ok(StatusCode::OK)
}

pub async fn claude_respond(
    State(state): State<SharedState>,
    Json(request): Json<RespondRequest>,
) -> Result<StatusCode, ApiError> {
    // A blocked hook waiting on this tool use takes priority; decisions
    // delivered this way are remembered for the session.
    if let Some(decision) = parse_decision(&request.response) {
        if state
            .bridge
            .respond(&request.tool_use_id, decision, cdev_protocol::DecisionScope::Session)
        {
            return Ok(StatusCode::OK);
        }
    }

    state
        .sessions
        .respond(&request.tool_use_id, &request.response, request.is_error)
        .await?;
    Ok(StatusCode::OK)
}

fn parse_decision(response: &str) -> Option<cdev_protocol::PermissionDecision> {
    match response {
        "allow" => Some(cdev_protocol::PermissionDecision::Allow),
        "deny" => Some(cdev_protocol::PermissionDecision::Deny),
        "ask" => Some(cdev_protocol::PermissionDecision::Ask),
        _ => None,
    }
}

pub async fn claude_sessions(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.sessions.sessions())
}

// ---------------------------------------------------------------------------
// Files / git
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
}

pub async fn get_file(
    State(state): State<SharedState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    if query.path.contains('\0') {
        return Err(ApiError::bad_request("invalid_path", "null byte in path"));
    }
    let candidate = state.repo.join(&query.path);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !resolved.starts_with(&state.repo) {
        return Err(ApiError::bad_request(
            "path_traversal",
            "path escapes the repository root",
        ));
    }

    let meta = std::fs::metadata(&resolved).map_err(ApiError::from_io_not_found)?;
    let max_bytes = state.config.files.max_file_size_kb * 1024;
    if meta.len() > max_bytes {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            format!("file exceeds {max_bytes} bytes"),
        ));
    }

    let bytes = std::fs::read(&resolved).map_err(ApiError::from_io_not_found)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

pub async fn git_status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let output = state
        .git
        .status(&state.repo)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], output.text).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct DiffQuery {
    pub path: Option<String>,
}

pub async fn git_diff(
    State(state): State<SharedState>,
    Query(query): Query<DiffQuery>,
) -> Result<Response, ApiError> {
    let output = state
        .git
        .diff(&state.repo, query.path.as_deref())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], output.text).into_response())
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

pub async fn pair_page(State(state): State<SharedState>) -> Html<String> {
    let pending = state.pairing.list_pending();
    let rows: String = pending
        .iter()
        .map(|r| format!("<li>{} from {} at {}</li>", r.id, r.remote_addr, r.created_at))
        .collect();
    Html(format!(
        "<!doctype html><title>cdev pairing</title><h1>cdev</h1>\
         <p>{} pairing request(s) pending.</p><ul>{rows}</ul>",
        pending.len()
    ))
}

/// Mint a pairing token and register the pending request. Requests from
/// loopback peers are auto-approved: the operator initiated them.
pub async fn pair_info(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<PairInfoResponse> {
    let minted = state
        .tokens
        .mint(TokenType::Pairing, state.tokens.default_ttl(TokenType::Pairing));
    let expires_at = Utc
        .timestamp_opt(minted.payload.exp, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request =
        state
            .pairing
            .ensure_pending(&minted.payload.nonce, &addr.to_string(), &user_agent, expires_at);
    if addr.ip().is_loopback() {
        state.pairing.approve(&request.id);
    }

    Json(PairInfoResponse {
        ws: state.config.server.ws_url(),
        http: state.config.server.http_url(),
        session: state.sessions.current().map(|s| s.session_id),
        repo: state.repo.to_string_lossy().into_owned(),
        token: Some(minted.token),
    })
}

pub async fn pair_exchange(
    State(state): State<SharedState>,
    Json(request): Json<PairExchangeRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let payload = state
        .tokens
        .validate_typed(&request.pairing_token, TokenType::Pairing)?;

    // An explicitly rejected (or still pending, when auth is enforced)
    // request must not produce tokens.
    match state.pairing.status(&payload.nonce) {
        Some(PairingState::Rejected) | Some(PairingState::Expired) => {
            return Err(ApiError::unauthorized("invalid_token"));
        }
        Some(PairingState::Pending) if state.config.security.require_auth => {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "pairing_pending",
                "pairing request has not been approved",
            ));
        }
        _ => {}
    }

    let device_id = request
        .device_id
        .clone()
        .unwrap_or_else(cdev_protocol::new_id);
    let pair = state.tokens.exchange_pairing(&request.pairing_token, &device_id)?;

    state
        .registry
        .register_device(
            &device_id,
            &pair.refresh.payload.nonce,
            pair.refresh.payload.exp,
            &pair.access.payload.nonce,
            pair.access.payload.exp,
        )
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state
        .registry
        .bind_workspace(&state.workspace_id, &device_id)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.pairing.clear(&payload.nonce);

    info!(
        component = "http",
        event = "pairing.exchanged",
        device_id = %device_id,
        "Pairing token exchanged for a token pair"
    );
    Ok(Json(TokenPairResponse {
        access_token: pair.access.token,
        refresh_token: pair.refresh.token,
        expires_at: rfc3339(pair.access.payload.exp),
        device_id,
    }))
}

pub async fn pair_refresh(
    State(state): State<SharedState>,
    Json(request): Json<PairRefreshRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let payload = state
        .tokens
        .validate_typed(&request.refresh_token, TokenType::Refresh)?;
    let device_id = payload.device_id.clone().unwrap_or_default();

    // Only the currently registered refresh nonce is accepted; anything
    // else is a replay of a rotated-out token.
    if !state
        .registry
        .is_refresh_nonce_valid(&device_id, &payload.nonce)
    {
        return Err(ApiError::unauthorized("invalid_token"));
    }

    let (pair, _consumed) = state.tokens.refresh(&request.refresh_token)?;
    state
        .registry
        .register_device(
            &device_id,
            &pair.refresh.payload.nonce,
            pair.refresh.payload.exp,
            &pair.access.payload.nonce,
            pair.access.payload.exp,
        )
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok(Json(TokenPairResponse {
        access_token: pair.access.token,
        refresh_token: pair.refresh.token,
        expires_at: rfc3339(pair.access.payload.exp),
        device_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PairDecisionRequest {
    pub request_id: String,
}

pub async fn pair_approve(
    State(state): State<SharedState>,
    Json(request): Json<PairDecisionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .pairing
        .approve(&request.request_id)
        .map(|_| StatusCode::OK)
        .ok_or_else(|| ApiError::not_found("no pending pairing request"))
}

pub async fn pair_reject(
    State(state): State<SharedState>,
    Json(request): Json<PairDecisionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .pairing
        .reject(&request.request_id)
        .map(|_| StatusCode::OK)
        .ok_or_else(|| ApiError::not_found("no pending pairing request"))
}

pub async fn auth_reset(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    state
        .tokens
        .revoke_all()
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(
        component = "http",
        event = "auth.reset",
        "All tokens revoked"
    );
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Permission hooks
// ---------------------------------------------------------------------------

/// Serves the hook binary. The hook always runs on the same machine as
/// the daemon, so non-loopback peers are refused outright - a remote
/// client must never be able to forge a permission decision.
pub async fn hook_permission_request(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(hook): Json<HookInput>,
) -> Result<Json<HookOutput>, ApiError> {
    if !addr.ip().is_loopback() {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "hook requests are accepted from localhost only",
        ));
    }

    let (decision, reason) = state
        .bridge
        .on_hook_request(&state.workspace_id, hook, None)
        .await;
    Ok(Json(HookOutput::decision(decision, reason)))
}

pub async fn permission_respond(
    State(state): State<SharedState>,
    Json(request): Json<PermissionResponse>,
) -> Result<StatusCode, ApiError> {
    if state
        .bridge
        .respond(&request.tool_use_id, request.decision, request.scope)
    {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::not_found("no pending permission request"))
    }
}

pub async fn permissions_pending(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.bridge.list_pending())
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_search_mode")]
    pub mode: SearchMode,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub include_binary: bool,
    #[serde(default)]
    pub include_sensitive: bool,
}

fn default_search_mode() -> SearchMode {
    SearchMode::Fuzzy
}

fn default_limit() -> usize {
    50
}

pub async fn index_search(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let results = state
        .indexer
        .search(SearchOptions {
            mode: query.mode,
            query: query.q,
            limit: query.limit,
            offset: query.offset,
            include_binary: query.include_binary,
            include_sensitive: query.include_sensitive,
        })
        .await?;
    Ok(Json(results).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub min_size: Option<i64>,
    #[serde(default)]
    pub max_size: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn index_files(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let sort = match query.sort.as_deref() {
        Some("size") => SortBy::Size,
        Some("modified") => SortBy::Modified,
        Some("path") => SortBy::Path,
        _ => SortBy::Name,
    };
    let results = state
        .indexer
        .list_files(ListOptions {
            directory: query.dir,
            recursive: query.recursive,
            sort,
            descending: query.desc,
            extension: query.ext,
            min_size: query.min_size,
            max_size: query.max_size,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(results).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    pub root: String,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_depth() -> usize {
    2
}

pub async fn index_tree(
    State(state): State<SharedState>,
    Query(query): Query<TreeQuery>,
) -> Result<Response, ApiError> {
    let tree = state.indexer.get_tree(query.root, query.depth).await?;
    Ok(Json(tree).into_response())
}

pub async fn index_stats(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let stats = state.indexer.get_stats().await?;
    Ok(Json(stats).into_response())
}

pub async fn index_rescan(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let summary = state.indexer.full_scan().await?;
    Ok(Json(json!({
        "scanned": summary.scanned,
        "total_bytes": summary.total_bytes,
        "degraded": summary.degraded,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub async fn image_upload(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let store = state
        .images
        .store_for(&state.workspace_id, paths::repo_images_dir(&state.repo))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let stored = store.store(&body)?;
    Ok(Json(cdev_protocol::ImageUploadResponse {
        id: stored.id,
        path: stored.path.to_string_lossy().into_owned(),
        bytes: stored.bytes,
        expires_at: chrono::DateTime::<Utc>::from(stored.expires_at).to_rfc3339(),
        deduplicated: stored.deduplicated,
    })
    .into_response())
}

pub async fn image_get(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let store = state
        .images
        .store_for(&state.workspace_id, paths::repo_images_dir(&state.repo))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let (_, bytes) = store.get(&id)?;
    let content_type = match detect_format(&bytes) {
        Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

pub async fn image_delete(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    let store = state
        .images
        .store_for(&state.workspace_id, paths::repo_images_dir(&state.repo))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    store.delete(&id)?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------

impl ApiError {
    fn from_io_not_found(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found("file not found")
        } else {
            Self::internal(err.to_string())
        }
    }
}

fn rfc3339(unix: i64) -> String {
    Utc.timestamp_opt(unix, 0)
        .single()
        .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1))
        .to_rfc3339()
}
