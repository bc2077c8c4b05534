//! Permission bridge: correlates out-of-band hook invocations with human
//! decisions from the mobile app.
//!
//! A hook request blocks its HTTP handler on a oneshot channel until a
//! decision arrives or the request times out (default answer: `ask`,
//! delegating to the agent's own UI). Decisions scoped to the session
//! are remembered in a per-session pattern memory consulted before any
//! prompt is published.
//!
//! Lock order is always `memory` before `pending`; responders remove the
//! pending record under the lock and send after releasing it, so exactly
//! one response is ever delivered per tool-use id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cdev_protocol::{
    new_id, now_rfc3339, DecisionScope, EventKind, HookInput, PendingPermission,
    PermissionDecision,
};

use crate::config::PERMISSION_TIMEOUT_CEILING_SECS;
use crate::hub::EventHub;
use crate::patterns::{generate_pattern, match_pattern};

/// A remembered allow/deny decision.
#[derive(Debug, Clone)]
pub struct StoredDecision {
    pub pattern: String,
    pub decision: PermissionDecision,
    pub created_at: Instant,
    pub usage_count: u64,
}

struct SessionMemory {
    entries: HashMap<String, StoredDecision>,
    last_used: Instant,
}

impl SessionMemory {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_used: Instant::now(),
        }
    }
}

struct PendingEntry {
    info: PendingPermission,
    tx: oneshot::Sender<PermissionDecision>,
}

pub struct PermissionBridge {
    /// session id -> pattern memory. Locked before `pending`.
    memory: Mutex<HashMap<String, SessionMemory>>,
    /// tool_use_id -> in-flight request.
    pending: Mutex<HashMap<String, PendingEntry>>,
    hub: EventHub,
    default_timeout: Duration,
    max_entries: usize,
    session_ttl: Duration,
}

impl PermissionBridge {
    pub fn new(
        hub: EventHub,
        default_timeout: Duration,
        max_entries: usize,
        session_ttl: Duration,
    ) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            hub,
            default_timeout,
            max_entries: max_entries.max(1),
            session_ttl,
        }
    }

    /// Serve one hook invocation: consult session memory, otherwise
    /// publish a prompt and block until a decision or the timeout.
    pub async fn on_hook_request(
        &self,
        workspace_id: &str,
        hook: HookInput,
        timeout: Option<Duration>,
    ) -> (PermissionDecision, Option<String>) {
        let pattern = generate_pattern(&hook.tool_name, &hook.tool_input);

        if let Some(decision) =
            self.lookup_memory(&hook.session_id, &pattern, &hook.tool_name, &hook.tool_input)
        {
            debug!(
                component = "permissions",
                event = "permissions.memory_hit",
                session_id = %hook.session_id,
                pattern = %pattern,
                decision = decision.as_str(),
                "Answered from session memory"
            );
            return (decision, Some(format!("remembered decision for {pattern}")));
        }

        let request_id = new_id();
        let description =
            cdev_agent::classify::describe_tool_use(&hook.tool_name, &hook.tool_input);
        let info = PendingPermission {
            request_id: request_id.clone(),
            session_id: hook.session_id.clone(),
            workspace_id: workspace_id.to_string(),
            tool_use_id: hook.tool_use_id.clone(),
            tool_name: hook.tool_name.clone(),
            input: hook.tool_input.clone(),
            description: description.clone(),
            created_at: now_rfc3339(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(hook.tool_use_id.clone(), PendingEntry { info, tx });
        }

        self.hub.publish(
            workspace_id,
            EventKind::ClaudePermission {
                session_id: hook.session_id.clone(),
                request_id,
                tool_use_id: hook.tool_use_id.clone(),
                tool_name: hook.tool_name.clone(),
                input: hook.tool_input.clone(),
                description,
            },
        );

        let timeout = timeout
            .unwrap_or(self.default_timeout)
            .min(Duration::from_secs(PERMISSION_TIMEOUT_CEILING_SECS));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => (decision, None),
            // Sender dropped (cancellation) or timeout: fall back to the
            // agent's local UI and make sure no record dangles.
            Ok(Err(_)) => (PermissionDecision::Ask, Some("request cancelled".into())),
            Err(_) => {
                self.remove_pending(&hook.tool_use_id);
                info!(
                    component = "permissions",
                    event = "permissions.timeout",
                    tool_use_id = %hook.tool_use_id,
                    timeout_secs = timeout.as_secs(),
                    "Permission request timed out, delegating to agent UI"
                );
                (PermissionDecision::Ask, Some("permission request timed out".into()))
            }
        }
    }

    /// Deliver a decision for a pending request. Returns `true` iff this
    /// call consumed the record; concurrent responders see at most one
    /// `true`.
    pub fn respond(
        &self,
        tool_use_id: &str,
        decision: PermissionDecision,
        scope: DecisionScope,
    ) -> bool {
        // Lock order: memory before pending.
        let mut memory = self.memory.lock().expect("memory map poisoned");
        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(tool_use_id)
        };

        let Some(entry) = entry else {
            drop(memory);
            debug!(
                component = "permissions",
                event = "permissions.respond_unknown",
                tool_use_id = %tool_use_id,
                "No pending request for tool use id"
            );
            return false;
        };

        if scope == DecisionScope::Session && decision != PermissionDecision::Ask {
            let pattern = generate_pattern(&entry.info.tool_name, &entry.info.input);
            Self::store_locked(
                &mut memory,
                &entry.info.session_id,
                pattern,
                decision,
                self.max_entries,
            );
        }
        drop(memory);

        // The record is already removed: even if the waiter has timed
        // out and dropped the receiver, nobody else can send.
        if entry.tx.send(decision).is_err() {
            warn!(
                component = "permissions",
                event = "permissions.respond_late",
                tool_use_id = %tool_use_id,
                "Waiter already gone (timed out); decision dropped"
            );
            return false;
        }
        true
    }

    /// Pending prompts, oldest first - used by reconnecting clients.
    pub fn list_pending(&self) -> Vec<PendingPermission> {
        let pending = self.pending.lock().expect("pending map poisoned");
        let mut list: Vec<_> = pending.values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Remove a single pending request by tool use id, if present.
    fn remove_pending(&self, tool_use_id: &str) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(tool_use_id);
    }

    /// Drop all pending requests for a session (session end). Waiters
    /// observe a closed channel and answer `ask`.
    pub fn cancel_session(&self, session_id: &str) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        pending.retain(|_, entry| entry.info.session_id != session_id);
    }

    /// Forget one session's memory.
    pub fn forget_session(&self, session_id: &str) {
        self.memory
            .lock()
            .expect("memory map poisoned")
            .remove(session_id);
    }

    /// Drop memories idle beyond the configured TTL.
    pub fn sweep_idle_sessions(&self) {
        let mut memory = self.memory.lock().expect("memory map poisoned");
        let ttl = self.session_ttl;
        let before = memory.len();
        memory.retain(|_, m| m.last_used.elapsed() < ttl);
        let swept = before - memory.len();
        if swept > 0 {
            debug!(
                component = "permissions",
                event = "permissions.memory_swept",
                swept = swept,
                "Swept idle session memories"
            );
        }
    }

    /// Look up a stored decision: exact pattern first, wildcard second.
    /// Bumps `usage_count` and the session's idle clock on a hit. The
    /// returned decision is a copy.
    fn lookup_memory(
        &self,
        session_id: &str,
        pattern: &str,
        tool_name: &str,
        input: &Value,
    ) -> Option<PermissionDecision> {
        let mut memory = self.memory.lock().expect("memory map poisoned");
        let session = memory.get_mut(session_id)?;
        session.last_used = Instant::now();

        if let Some(stored) = session.entries.get_mut(pattern) {
            stored.usage_count += 1;
            return Some(stored.decision);
        }

        for stored in session.entries.values_mut() {
            if match_pattern(&stored.pattern, tool_name, input) {
                stored.usage_count += 1;
                return Some(stored.decision);
            }
        }
        None
    }

    fn store_locked(
        memory: &mut HashMap<String, SessionMemory>,
        session_id: &str,
        pattern: String,
        decision: PermissionDecision,
        max_entries: usize,
    ) {
        let session = memory
            .entry(session_id.to_string())
            .or_insert_with(SessionMemory::new);
        session.last_used = Instant::now();

        if session.entries.len() >= max_entries && !session.entries.contains_key(&pattern) {
            // Evict the oldest-created entry.
            if let Some(oldest) = session
                .entries
                .values()
                .min_by_key(|e| e.created_at)
                .map(|e| e.pattern.clone())
            {
                session.entries.remove(&oldest);
            }
        }

        session.entries.insert(
            pattern.clone(),
            StoredDecision {
                pattern,
                decision,
                created_at: Instant::now(),
                usage_count: 0,
            },
        );
    }

    #[cfg(test)]
    fn stored_count(&self, session_id: &str) -> usize {
        self.memory
            .lock()
            .unwrap()
            .get(session_id)
            .map(|m| m.entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn bridge(timeout: Duration) -> Arc<PermissionBridge> {
        Arc::new(PermissionBridge::new(
            EventHub::new(64),
            timeout,
            100,
            Duration::from_secs(3600),
        ))
    }

    fn hook(tool: &str, input: Value, tool_use_id: &str) -> HookInput {
        HookInput {
            tool_name: tool.to_string(),
            tool_input: input,
            tool_use_id: tool_use_id.to_string(),
            session_id: "sess-1".to_string(),
            cwd: "/repo".to_string(),
        }
    }

    #[tokio::test]
    async fn respond_unblocks_waiter() {
        let bridge = bridge(Duration::from_secs(5));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
                    .await
            })
        };

        // Wait until the request is registered.
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(bridge.respond("t1", PermissionDecision::Allow, DecisionScope::Once));
        let (decision, _) = waiter.await.unwrap();
        assert_eq!(decision, PermissionDecision::Allow);
        assert!(bridge.list_pending().is_empty());
    }

    #[tokio::test]
    async fn exactly_one_responder_wins() {
        let bridge = bridge(Duration::from_secs(5));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
                    .await
            })
        };
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut wins = 0;
        for _ in 0..8 {
            if bridge.respond("t1", PermissionDecision::Deny, DecisionScope::Once) {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let (decision, _) = waiter.await.unwrap();
        assert_eq!(decision, PermissionDecision::Deny);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_answers_ask_and_removes_record() {
        let bridge = bridge(Duration::from_millis(50));
        let (decision, reason) = bridge
            .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
            .await;
        assert_eq!(decision, PermissionDecision::Ask);
        assert!(reason.unwrap().contains("timed out"));
        assert!(bridge.list_pending().is_empty());
        // A late response finds nothing and never panics.
        assert!(!bridge.respond("t1", PermissionDecision::Allow, DecisionScope::Once));
    }

    #[tokio::test]
    async fn session_scope_is_remembered_and_wildcard_matches() {
        let bridge = bridge(Duration::from_secs(5));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request(
                        "ws",
                        hook("Write", json!({"file_path": "src/x.py"}), "t1"),
                        None,
                    )
                    .await
            })
        };
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bridge.respond("t1", PermissionDecision::Allow, DecisionScope::Session));
        let (decision, _) = waiter.await.unwrap();
        assert_eq!(decision, PermissionDecision::Allow);

        // Same pattern, different file: auto-approved with no new prompt.
        let (decision, reason) = bridge
            .on_hook_request(
                "ws",
                hook("Write", json!({"file_path": "other/y.py"}), "t2"),
                None,
            )
            .await;
        assert_eq!(decision, PermissionDecision::Allow);
        assert!(reason.unwrap().contains("Write(*.py)"));
        assert!(bridge.list_pending().is_empty());
    }

    #[tokio::test]
    async fn once_scope_is_not_remembered() {
        let bridge = bridge(Duration::from_secs(5));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
                    .await
            })
        };
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bridge.respond("t1", PermissionDecision::Allow, DecisionScope::Once);
        waiter.await.unwrap();
        assert_eq!(bridge.stored_count("sess-1"), 0);
    }

    #[tokio::test]
    async fn memory_cap_evicts_oldest() {
        let bridge = Arc::new(PermissionBridge::new(
            EventHub::new(64),
            Duration::from_secs(1),
            2,
            Duration::from_secs(3600),
        ));

        for (i, cmd) in ["ls", "pwd", "whoami"].iter().enumerate() {
            let id = format!("t{i}");
            let waiter = {
                let bridge = bridge.clone();
                let hook = hook("Bash", json!({"command": *cmd}), &id);
                tokio::spawn(async move { bridge.on_hook_request("ws", hook, None).await })
            };
            while bridge.list_pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            bridge.respond(&id, PermissionDecision::Allow, DecisionScope::Session);
            waiter.await.unwrap();
        }

        assert_eq!(bridge.stored_count("sess-1"), 2);
        // The oldest pattern (ls) was evicted; a new ls prompt times out.
        let (decision, _) = bridge
            .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t9"), None)
            .await;
        assert_eq!(decision, PermissionDecision::Ask);
    }

    #[tokio::test]
    async fn cancel_session_unblocks_with_ask() {
        let bridge = bridge(Duration::from_secs(30));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
                    .await
            })
        };
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bridge.cancel_session("sess-1");
        let (decision, _) = waiter.await.unwrap();
        assert_eq!(decision, PermissionDecision::Ask);
        assert!(bridge.list_pending().is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_forgets_sessions() {
        let bridge = Arc::new(PermissionBridge::new(
            EventHub::new(64),
            Duration::from_secs(5),
            100,
            Duration::from_millis(0),
        ));
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .on_hook_request("ws", hook("Bash", json!({"command": "ls"}), "t1"), None)
                    .await
            })
        };
        while bridge.list_pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bridge.respond("t1", PermissionDecision::Allow, DecisionScope::Session);
        waiter.await.unwrap();
        assert_eq!(bridge.stored_count("sess-1"), 1);

        bridge.sweep_idle_sessions();
        assert_eq!(bridge.stored_count("sess-1"), 0);
    }
}
