//! cdev agent connector
//!
//! Spawns the external coding-agent CLI and manages its I/O. Two modes:
//! headless (pipes, stream-json parsed line by line) and terminal (a
//! pseudo-terminal mirrored to the controlling TTY and teed to a caller
//! supplied writer).

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

pub mod classify;
pub mod command;
pub mod headless;
pub mod reader;
pub mod terminal;

pub use classify::{classify_line, AgentOutput, StatusHint};
pub use command::build_agent_args;
pub use headless::HeadlessSession;
pub use terminal::TerminalSession;

use cdev_protocol::LaunchMode;

/// Errors from spawning and driving the agent subprocess.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent binary {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("agent child process has no {0} handle")]
    MissingStdio(&'static str),

    #[error("failed to write to agent stdin: {0}")]
    StdinWrite(std::io::Error),

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("session already stopped")]
    AlreadyStopped,
}

/// How to launch a session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Path or name of the agent binary (resolved through PATH when bare).
    pub binary: PathBuf,
    pub cwd: PathBuf,
    pub mode: LaunchMode,
    /// Session id to continue/resume, per [`LaunchMode`].
    pub session_id: Option<String>,
    pub prompt: String,
    /// User-supplied extra arguments, deduplicated against the fixed set.
    pub extra_args: Vec<String>,
    /// Maximum bytes accepted for a single stdout line before it is
    /// reported as too long and discarded.
    pub max_line_bytes: usize,
    /// Grace period between interrupt and kill on stop.
    pub stop_grace: Duration,
    /// Hard session timeout; `None` disables it.
    pub session_timeout: Option<Duration>,
    /// Directory for the JSONL transcript. The file is named
    /// `<prefix>_<pid>.jsonl` once the child pid is known; every raw
    /// stdout line is appended to it.
    pub log_dir: PathBuf,
    pub log_prefix: String,
}

/// Events emitted by a running session.
#[derive(Debug)]
pub enum AgentEvent {
    /// A classified piece of agent output (headless mode).
    Output(AgentOutput),
    /// Raw bytes from the PTY (terminal mode).
    PtyChunk(Vec<u8>),
    /// A stdout line exceeded the configured maximum and was discarded.
    LineTooLong { limit: usize },
    /// The process exited. `code` is `None` when killed by signal.
    Exited { code: Option<i32> },
}

/// The JSONL line answering a tool prompt, newline-terminated - for
/// callers writing directly to a PTY instead of through
/// [`HeadlessSession::respond`].
pub fn respond_line(tool_use_id: &str, response: &str, is_error: bool) -> String {
    let mut line = respond_payload(tool_use_id, response, is_error).to_string();
    line.push('\n');
    line
}

/// A single JSONL object written to the agent's stdin to answer a tool
/// prompt, matching the stream-json input contract.
pub(crate) fn respond_payload(tool_use_id: &str, response: &str, is_error: bool) -> Value {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": response,
                "is_error": is_error,
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_payload_shape() {
        let v = respond_payload("toolu_01", "ok", false);
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["content"][0]["tool_use_id"], "toolu_01");
        assert_eq!(v["message"]["content"][0]["is_error"], false);
    }
}
