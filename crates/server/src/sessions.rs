//! Agent session manager: bridges the subprocess connector to the hub.
//!
//! A workspace runs at most one session at a time. Connector events are
//! translated into hub events (`session_start`, `claude_log`,
//! `claude_status`, `claude_waiting`, `claude_permission`) and drive the
//! session's state machine; `respond_to_claude` feeds decisions back
//! onto the agent's stdin.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use cdev_agent::{
    AgentError, AgentEvent, AgentOutput, HeadlessSession, SpawnSpec, StatusHint, TerminalSession,
};
use cdev_protocol::{
    new_id, now_rfc3339, EventKind, LaunchMode, RunClaudeRequest, SessionInfo, SessionState,
};

use crate::config::ClaudeConfig;
use crate::hub::EventHub;
use crate::paths;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already running in this workspace")]
    Conflict,
    #[error("no active session")]
    NotRunning,
    #[error(transparent)]
    Spawn(#[from] AgentError),
}

enum AgentHandle {
    Headless(Arc<HeadlessSession>),
    Terminal(Arc<AsyncMutex<TerminalSession>>),
}

struct ActiveSession {
    info: SessionInfo,
    state: Arc<Mutex<SessionState>>,
    handle: AgentHandle,
}

struct Inner {
    workspace_id: String,
    repo: PathBuf,
    config: ClaudeConfig,
    hub: EventHub,
    /// Serialises concurrent `run` calls so two spawns cannot race past
    /// the one-session-per-workspace check.
    run_lock: AsyncMutex<()>,
    active: Mutex<Option<ActiveSession>>,
    history: Mutex<Vec<SessionInfo>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(workspace_id: String, repo: PathBuf, config: ClaudeConfig, hub: EventHub) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspace_id,
                repo,
                config,
                hub,
                run_lock: AsyncMutex::new(()),
                active: Mutex::new(None),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Launch a session. Fails with [`SessionError::Conflict`] while one
    /// is still running.
    pub async fn run(&self, request: RunClaudeRequest) -> Result<SessionInfo, SessionError> {
        let _run_guard = self.inner.run_lock.lock().await;
        {
            let active = self.inner.active.lock().expect("session lock poisoned");
            if let Some(session) = active.as_ref() {
                let exited = *session.state.lock().expect("state poisoned") == SessionState::Exited;
                if !exited {
                    return Err(SessionError::Conflict);
                }
            }
        }

        let session_id = new_id();
        let parent_session_id = match request.mode {
            LaunchMode::New => None,
            _ => request.session_id.clone(),
        };

        let mut extra_args = self.inner.config.args.clone();
        extra_args.extend(request.args.iter().cloned());

        let spec = SpawnSpec {
            binary: self.inner.config.binary.clone(),
            cwd: self.inner.repo.clone(),
            mode: request.mode,
            session_id: request.session_id.clone(),
            prompt: request.prompt.clone(),
            extra_args,
            max_line_bytes: self.inner.config.max_line_bytes,
            stop_grace: Duration::from_secs(self.inner.config.stop_grace_secs),
            session_timeout: match self.inner.config.session_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            log_dir: paths::repo_log_dir(&self.inner.repo),
            log_prefix: "claude".to_string(),
        };

        let state = Arc::new(Mutex::new(SessionState::Starting));
        let (handle, event_rx, log_path) = if self.inner.config.headless {
            let mut session = HeadlessSession::spawn(spec).await?;
            let event_rx = session.take_event_rx().expect("fresh session has event rx");
            let log_path = session.log_path().to_path_buf();
            (AgentHandle::Headless(Arc::new(session)), event_rx, log_path)
        } else {
            let mut session = TerminalSession::spawn(spec, true)?;
            let event_rx = session.take_event_rx().expect("fresh session has event rx");
            (
                AgentHandle::Terminal(Arc::new(AsyncMutex::new(session))),
                event_rx,
                PathBuf::new(),
            )
        };

        let info = SessionInfo {
            session_id: session_id.clone(),
            workspace_id: self.inner.workspace_id.clone(),
            cwd: self.inner.repo.to_string_lossy().into_owned(),
            mode: request.mode,
            state: SessionState::Starting,
            parent_session_id,
            started_at: now_rfc3339(),
            ended_at: None,
            log_path: log_path.to_string_lossy().into_owned(),
        };

        {
            let mut active = self.inner.active.lock().expect("session lock poisoned");
            *active = Some(ActiveSession {
                info: info.clone(),
                state: state.clone(),
                handle,
            });
        }

        info!(
            component = "sessions",
            event = "session.started",
            session_id = %session_id,
            mode = ?request.mode,
            "Agent session started"
        );
        self.inner.hub.publish(
            self.inner.workspace_id.clone(),
            EventKind::SessionStart {
                session_id: session_id.clone(),
                mode: request.mode,
                cwd: info.cwd.clone(),
            },
        );

        tokio::spawn(event_loop(
            self.inner.clone(),
            session_id.clone(),
            state,
            event_rx,
        ));

        Ok(info)
    }

    /// Two-phase stop of the active session.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let handle = {
            let mut active = self.inner.active.lock().expect("session lock poisoned");
            let Some(session) = active.as_mut() else {
                return Err(SessionError::NotRunning);
            };
            *session.state.lock().expect("state poisoned") = SessionState::Stopping;
            match &session.handle {
                AgentHandle::Headless(h) => AgentHandle::Headless(h.clone()),
                AgentHandle::Terminal(h) => AgentHandle::Terminal(h.clone()),
            }
        };

        match handle {
            AgentHandle::Headless(session) => session.stop().await,
            AgentHandle::Terminal(session) => session.lock().await.stop().await,
        }
        Ok(())
    }

    /// Answer a pending tool prompt; transitions the session out of its
    /// awaiting state.
    pub async fn respond(
        &self,
        tool_use_id: &str,
        response: &str,
        is_error: bool,
    ) -> Result<(), SessionError> {
        let handle = {
            let active = self.inner.active.lock().expect("session lock poisoned");
            let Some(session) = active.as_ref() else {
                return Err(SessionError::NotRunning);
            };
            match &session.handle {
                AgentHandle::Headless(h) => AgentHandle::Headless(h.clone()),
                AgentHandle::Terminal(h) => AgentHandle::Terminal(h.clone()),
            }
        };

        match handle {
            AgentHandle::Headless(session) => {
                session.respond(tool_use_id, response, is_error).await?;
            }
            AgentHandle::Terminal(session) => {
                let payload = cdev_agent::respond_line(tool_use_id, response, is_error);
                session.lock().await.write_bytes(payload.into_bytes()).await?;
            }
        }

        if let Some(session) = self
            .inner
            .active
            .lock()
            .expect("session lock poisoned")
            .as_ref()
        {
            let mut state = session.state.lock().expect("state poisoned");
            if matches!(
                *state,
                SessionState::AwaitingPermission | SessionState::AwaitingUser
            ) {
                *state = SessionState::Running;
            }
        }
        Ok(())
    }

    /// Write raw bytes to a terminal-mode session's PTY.
    pub async fn write_terminal(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        let handle = {
            let active = self.inner.active.lock().expect("session lock poisoned");
            match active.as_ref().map(|s| &s.handle) {
                Some(AgentHandle::Terminal(h)) => h.clone(),
                _ => return Err(SessionError::NotRunning),
            }
        };
        handle.lock().await.write_bytes(bytes).await?;
        Ok(())
    }

    /// Snapshot of the active session, if any.
    pub fn current(&self) -> Option<SessionInfo> {
        let active = self.inner.active.lock().expect("session lock poisoned");
        active.as_ref().map(|session| {
            let mut info = session.info.clone();
            info.state = *session.state.lock().expect("state poisoned");
            info
        })
    }

    /// History plus the active session, newest last.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut list = self
            .inner
            .history
            .lock()
            .expect("history lock poisoned")
            .clone();
        if let Some(current) = self.current() {
            list.push(current);
        }
        list
    }
}

/// Translate connector events into hub events and state transitions.
async fn event_loop(
    inner: Arc<Inner>,
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    mut event_rx: tokio::sync::mpsc::Receiver<AgentEvent>,
) {
    let workspace = inner.workspace_id.clone();
    let set_state = |next: SessionState| {
        *state.lock().expect("state poisoned") = next;
    };

    while let Some(event) = event_rx.recv().await {
        match event {
            AgentEvent::Output(AgentOutput::AssistantText { text }) => {
                set_state(SessionState::Running);
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeLog {
                        session_id: session_id.clone(),
                        stream: "jsonl".to_string(),
                        content: text,
                    },
                );
            }
            AgentEvent::Output(AgentOutput::ToolUse {
                tool_use_id,
                tool_name,
                input,
                description,
            }) => {
                set_state(SessionState::AwaitingPermission);
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudePermission {
                        session_id: session_id.clone(),
                        request_id: tool_use_id.clone(),
                        tool_use_id,
                        tool_name,
                        input,
                        description,
                    },
                );
            }
            AgentEvent::Output(AgentOutput::Question {
                tool_use_id,
                question,
            }) => {
                set_state(SessionState::AwaitingUser);
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeWaiting {
                        session_id: session_id.clone(),
                        tool_use_id,
                        question,
                    },
                );
            }
            AgentEvent::Output(AgentOutput::Status { hint, message }) => {
                let next = match hint {
                    StatusHint::Running => SessionState::Running,
                    StatusHint::Done | StatusHint::Failed => SessionState::Idle,
                };
                set_state(next);
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeStatus {
                        session_id: session_id.clone(),
                        state: next,
                        exit_code: None,
                        message,
                    },
                );
            }
            AgentEvent::Output(AgentOutput::Raw { line }) => {
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeLog {
                        session_id: session_id.clone(),
                        stream: "jsonl".to_string(),
                        content: line,
                    },
                );
            }
            AgentEvent::PtyChunk(bytes) => {
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeLog {
                        session_id: session_id.clone(),
                        stream: "pty".to_string(),
                        content: String::from_utf8_lossy(&bytes).into_owned(),
                    },
                );
            }
            AgentEvent::LineTooLong { limit } => {
                warn!(
                    component = "sessions",
                    event = "session.line_too_long",
                    session_id = %session_id,
                    limit = limit,
                    "Agent emitted an over-long line"
                );
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeLog {
                        session_id: session_id.clone(),
                        stream: "jsonl".to_string(),
                        content: format!("[dropped line exceeding {limit} bytes]"),
                    },
                );
            }
            AgentEvent::Exited { code } => {
                set_state(SessionState::Exited);
                let message = match code {
                    Some(0) => None,
                    Some(code) => Some(format!("agent exited with status {code}")),
                    None => Some("agent killed by signal".to_string()),
                };
                inner.hub.publish(
                    workspace.clone(),
                    EventKind::ClaudeStatus {
                        session_id: session_id.clone(),
                        state: SessionState::Exited,
                        exit_code: code,
                        message,
                    },
                );

                // Retire the session into history.
                let mut active = inner.active.lock().expect("session lock poisoned");
                if let Some(session) = active.take() {
                    if session.info.session_id == session_id {
                        let mut info = session.info;
                        info.state = SessionState::Exited;
                        info.ended_at = Some(now_rfc3339());
                        inner
                            .history
                            .lock()
                            .expect("history lock poisoned")
                            .push(info);
                    } else {
                        // A newer session took the slot; put it back.
                        *active = Some(session);
                    }
                }

                info!(
                    component = "sessions",
                    event = "session.exited",
                    session_id = %session_id,
                    exit_code = ?code,
                    "Agent session ended"
                );
                break;
            }
        }
    }
}
