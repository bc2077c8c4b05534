//! WebSocket handling: hub fan-out plus JSON-RPC.
//!
//! Lifecycle: upgrade -> origin check -> hub subscription -> one reader
//! and one writer task sharing a close signal. The writer serialises all
//! outbound frames; server pings every 30 s and a peer silent for 90 s
//! is considered dead. No buffered events are replayed on reconnect -
//! clients catch up on pending prompts via `list_pending_permissions`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cdev_protocol::rpc::{RpcRequest, RpcResponse};
use cdev_protocol::rpc::INVALID_REQUEST;

use crate::hub::EventFilter;
use crate::origin::origin_allowed;
use crate::rpc;
use crate::state::SharedState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PEER_TIMEOUT: Duration = Duration::from_secs(90);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !origin_allowed(
        origin,
        &state.config.security.allowed_origins,
        state.config.server.is_localhost_bind(),
    ) {
        warn!(
            component = "websocket",
            event = "ws.origin_forbidden",
            origin = origin.unwrap_or("<none>"),
            "Rejected WebSocket upgrade by origin"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    state.connected_clients.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connected",
        clients = state.connected_clients.load(Ordering::Relaxed),
        "WebSocket client connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(100);

    // Writer: the only task touching the sink.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Hub fan-out: every subscribed event becomes a notification frame.
    let subscription = Arc::new(state.hub.subscribe(EventFilter::default()));
    let event_task = {
        let subscription = subscription.clone();
        let outbound = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let note = RpcResponse::notification(&event);
                let Ok(json) = serde_json::to_string(&note) else {
                    continue;
                };
                if outbound.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        })
    };

    // Liveness: ping on an interval, give up on a silent peer.
    let last_pong = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
    let ping_task = {
        let outbound = outbound_tx.clone();
        let last_pong = last_pong.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                let silent = last_pong
                    .lock()
                    .map(|t| t.elapsed() > PEER_TIMEOUT)
                    .unwrap_or(true);
                if silent {
                    debug!(
                        component = "websocket",
                        event = "ws.peer_timeout",
                        "Peer silent beyond timeout, closing"
                    );
                    let _ = outbound.send(Message::Close(None)).await;
                    break;
                }
                if outbound
                    .send(Message::Ping(Bytes::from_static(b"cdev")))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    // Reader: JSON-RPC requests in, responses out.
    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(m) => m,
            Err(e) => {
                debug!(
                    component = "websocket",
                    event = "ws.read_error",
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let response = match serde_json::from_str::<RpcRequest>(&text) {
                    Ok(request) => rpc::dispatch(&state, request).await,
                    Err(e) => Some(RpcResponse::error(
                        None,
                        INVALID_REQUEST,
                        format!("invalid request: {e}"),
                    )),
                };
                if let Some(response) = response {
                    let Ok(json) = serde_json::to_string(&response) else {
                        continue;
                    };
                    if outbound_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = outbound_tx.send(Message::Pong(data)).await;
            }
            Message::Pong(_) => {
                if let Ok(mut t) = last_pong.lock() {
                    *t = tokio::time::Instant::now();
                }
            }
            Message::Close(_) => break,
            Message::Binary(data) => {
                // Terminal-mode input: raw bytes go straight to the PTY.
                if let Err(e) = state.sessions.write_terminal(data.to_vec()).await {
                    debug!(
                        component = "websocket",
                        event = "ws.terminal_write_rejected",
                        error = %e,
                        "Dropped binary frame without a terminal session"
                    );
                }
            }
        }
    }

    subscription.close();
    send_task.abort();
    event_task.abort();
    ping_task.abort();

    state.connected_clients.fetch_sub(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.disconnected",
        clients = state.connected_clients.load(Ordering::Relaxed),
        "WebSocket client disconnected"
    );
}
