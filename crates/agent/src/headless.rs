//! Headless (pipe) mode: the agent runs with piped stdio and speaks
//! stream-json on stdout.
//!
//! Task layout mirrors a connector: one stdin writer, one stdout reader
//! that owns the child and reports its exit, one stderr logger. The
//! reader appends every raw line to the session's JSONL transcript
//! before classification so post-mortems see exactly what the agent
//! emitted.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::classify_line;
use crate::reader::{BoundedLineReader, LineOutcome};
use crate::{respond_payload, AgentError, AgentEvent, SpawnSpec};

pub struct HeadlessSession {
    stdin_tx: mpsc::Sender<String>,
    event_rx: Option<mpsc::Receiver<AgentEvent>>,
    pid: u32,
    log_path: std::path::PathBuf,
    exited: Arc<AtomicBool>,
    stop_grace: Duration,
}

impl HeadlessSession {
    /// Spawn the agent per `spec` and start the I/O tasks.
    pub async fn spawn(spec: SpawnSpec) -> Result<Self, AgentError> {
        let args = crate::command::build_agent_args(
            spec.mode,
            spec.session_id.as_deref(),
            &spec.extra_args,
            &spec.prompt,
        );

        info!(
            component = "agent",
            event = "agent.spawn",
            binary = %spec.binary.display(),
            cwd = %spec.cwd.display(),
            mode = ?spec.mode,
            "Spawning agent in headless mode"
        );

        let mut command = tokio::process::Command::new(&spec.binary);
        command
            .args(&args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so stop() can signal the whole tree.
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            binary: spec.binary.clone(),
            source,
        })?;

        let pid = child.id().ok_or(AgentError::MissingStdio("pid"))?;
        let stdin = child.stdin.take().ok_or(AgentError::MissingStdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(AgentError::MissingStdio("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(AgentError::MissingStdio("stderr"))?;

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = tokio::io::AsyncBufReadExt::lines(reader);
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "agent",
                    event = "agent.stderr",
                    line = %line,
                    "Agent stderr"
                );
            }
        });

        let log_path = spec
            .log_dir
            .join(format!("{}_{}.jsonl", spec.log_prefix, pid));
        let reader_log_path = log_path.clone();
        let max_line = spec.max_line_bytes;
        let reader_exited = exited.clone();
        tokio::spawn(async move {
            read_stdout(child, stdout, reader_log_path, max_line, event_tx, reader_exited).await;
        });

        if let Some(timeout) = spec.session_timeout {
            let watchdog_exited = exited.clone();
            let grace = spec.stop_grace;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !watchdog_exited.load(Ordering::SeqCst) {
                    warn!(
                        component = "agent",
                        event = "agent.timeout",
                        pid = pid,
                        timeout_secs = timeout.as_secs(),
                        "Session timeout reached, stopping agent"
                    );
                    two_phase_stop(pid, grace, &watchdog_exited).await;
                }
            });
        }

        Ok(Self {
            stdin_tx,
            event_rx: Some(event_rx),
            pid,
            log_path,
            exited,
            stop_grace: spec.stop_grace,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.event_rx.take()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Path of this session's JSONL transcript.
    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Answer a pending tool prompt over stdin.
    pub async fn respond(
        &self,
        tool_use_id: &str,
        response: &str,
        is_error: bool,
    ) -> Result<(), AgentError> {
        let payload = respond_payload(tool_use_id, response, is_error);
        self.write_stdin(payload.to_string()).await
    }

    /// Write one raw JSONL line to the agent's stdin.
    pub async fn write_stdin(&self, line: String) -> Result<(), AgentError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyStopped);
        }
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| AgentError::AlreadyStopped)
    }

    /// Two-phase stop: interrupt the process group, wait out the grace
    /// period, then kill whatever is left.
    pub async fn stop(&self) {
        two_phase_stop(self.pid, self.stop_grace, &self.exited).await;
    }
}

async fn two_phase_stop(pid: u32, grace: Duration, exited: &Arc<AtomicBool>) {
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGINT) {
        debug!(
            component = "agent",
            event = "agent.stop.interrupt_failed",
            pid = pid,
            error = %e,
            "Interrupt failed (process likely already gone)"
        );
        return;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if exited.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if !exited.load(Ordering::SeqCst) {
        warn!(
            component = "agent",
            event = "agent.stop.kill",
            pid = pid,
            "Agent did not exit within grace period, killing process group"
        );
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_stdout(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    log_path: std::path::PathBuf,
    max_line_bytes: usize,
    event_tx: mpsc::Sender<AgentEvent>,
    exited: Arc<AtomicBool>,
) {
    let mut log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(
                component = "agent",
                event = "agent.log_open_failed",
                path = %log_path.display(),
                error = %e,
                "Cannot open session transcript, continuing without it"
            );
            None
        }
    };

    let mut reader = BoundedLineReader::new(BufReader::new(stdout), max_line_bytes);
    loop {
        match reader.next_line().await {
            Ok(Some(LineOutcome::Line(line))) => {
                if let Some(f) = log_file.as_mut() {
                    let _ = f.write_all(line.as_bytes()).await;
                    let _ = f.write_all(b"\n").await;
                }
                for output in classify_line(&line) {
                    if event_tx.send(AgentEvent::Output(output)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Some(LineOutcome::TooLong { limit })) => {
                warn!(
                    component = "agent",
                    event = "agent.line_too_long",
                    limit = limit,
                    "Dropped over-long stdout line"
                );
                if event_tx
                    .send(AgentEvent::LineTooLong { limit })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    component = "agent",
                    event = "agent.stdout_read_error",
                    error = %e,
                    "Agent stdout read failed"
                );
                break;
            }
        }
    }

    if let Some(f) = log_file.as_mut() {
        let _ = f.flush().await;
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(
                component = "agent",
                event = "agent.wait_failed",
                error = %e,
                "Failed to reap agent process"
            );
            None
        }
    };
    exited.store(true, Ordering::SeqCst);

    info!(
        component = "agent",
        event = "agent.exited",
        exit_code = ?code,
        "Agent process exited"
    );
    let _ = event_tx.send(AgentEvent::Exited { code }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdev_protocol::LaunchMode;

    fn spec_for(binary: &str, prompt: &str, dir: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            binary: binary.into(),
            cwd: dir.to_path_buf(),
            mode: LaunchMode::New,
            session_id: None,
            prompt: prompt.to_string(),
            extra_args: Vec::new(),
            max_line_bytes: 1024 * 1024,
            stop_grace: Duration::from_millis(500),
            session_timeout: None,
            log_dir: dir.to_path_buf(),
            log_prefix: "claude".to_string(),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let err = HeadlessSession::spawn(spec_for(
            "/nonexistent/definitely-not-a-binary",
            "hi",
            dir.path(),
        ))
        .await
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, AgentError::Spawn { .. }));
    }

    #[tokio::test]
    async fn echo_style_agent_lines_are_classified_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        // `cat` is a stand-in agent: ignores args, echoes nothing, exits 0.
        // Use /bin/echo so stdout carries a raw (non-JSON) line.
        let mut session = HeadlessSession::spawn(spec_for("/bin/echo", "ignored", dir.path()))
            .await
            .expect("echo spawns");
        let mut rx = session.take_event_rx().unwrap();

        let mut saw_output = false;
        let mut saw_exit = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Output(_) => saw_output = true,
                AgentEvent::Exited { code } => {
                    assert_eq!(code, Some(0));
                    saw_exit = true;
                }
                _ => {}
            }
        }
        assert!(saw_output, "echo output should be forwarded");
        assert!(saw_exit);
        assert!(session.is_exited());

        let name = session.log_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("claude_") && name.ends_with(".jsonl"));
        let transcript = std::fs::read_to_string(session.log_path()).unwrap();
        assert!(!transcript.is_empty());
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_agent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // Fake agent that ignores its argv and blocks.
        let script = dir.path().join("fake-agent.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = spec_for(script.to_str().unwrap(), "ignored", dir.path());
        let mut session = HeadlessSession::spawn(spec).await.expect("script spawns");
        let mut rx = session.take_event_rx().unwrap();

        session.stop().await;

        let mut exited = false;
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Exited { .. } = event {
                exited = true;
            }
        }
        assert!(exited);
    }
}
