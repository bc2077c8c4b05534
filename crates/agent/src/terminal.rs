//! Terminal mode: the agent runs on a pseudo-terminal mirrored to the
//! controlling TTY.
//!
//! Master output is copied byte-for-byte to the local terminal and teed
//! onto the event channel as [`AgentEvent::PtyChunk`] so the server can
//! forward it to remote subscribers. Local stdin and remote bytes both
//! feed the PTY master. Cooked mode is restored on every exit path via
//! an RAII guard.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cdev_protocol::LaunchMode;

use crate::{AgentError, AgentEvent, SpawnSpec};

/// Restores the terminal to its original (cooked) mode on drop.
struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    fn enter() -> Self {
        let stdin = std::io::stdin();
        let fd = stdin.as_fd();
        match termios::tcgetattr(fd) {
            Ok(original) => {
                let mut raw = original.clone();
                termios::cfmakeraw(&mut raw);
                if let Err(e) = termios::tcsetattr(fd, SetArg::TCSANOW, &raw) {
                    warn!(
                        component = "agent",
                        event = "agent.raw_mode_failed",
                        error = %e,
                        "Could not enter raw mode"
                    );
                    return Self { original: None };
                }
                Self {
                    original: Some(original),
                }
            }
            // Not a TTY (tests, pipes) - nothing to restore.
            Err(_) => Self { original: None },
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &original);
        }
    }
}

pub struct TerminalSession {
    input_tx: mpsc::Sender<Vec<u8>>,
    event_rx: Option<mpsc::Receiver<AgentEvent>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    stop_grace: Duration,
}

impl TerminalSession {
    /// Spawn the agent on a fresh PTY.
    ///
    /// When `mirror_local` is true, master output is also copied to the
    /// daemon's own stdout and local stdin is forwarded to the agent
    /// (interactive use). Remote bytes always flow via [`write_bytes`].
    pub fn spawn(spec: SpawnSpec, mirror_local: bool) -> Result<Self, AgentError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AgentError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.binary);
        match spec.mode {
            LaunchMode::New => {}
            LaunchMode::Continue => {
                cmd.arg("--continue");
                if let Some(id) = &spec.session_id {
                    cmd.arg(id);
                }
            }
            LaunchMode::Resume => {
                cmd.arg("--resume");
                if let Some(id) = &spec.session_id {
                    cmd.arg(id);
                }
            }
        }
        for arg in &spec.extra_args {
            cmd.arg(arg);
        }
        if !spec.prompt.is_empty() {
            cmd.arg(&spec.prompt);
        }
        cmd.cwd(&spec.cwd);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AgentError::Pty(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        info!(
            component = "agent",
            event = "agent.spawn",
            binary = %spec.binary.display(),
            cwd = %spec.cwd.display(),
            pid = ?pid,
            "Spawning agent in terminal mode"
        );

        let mut master_reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AgentError::Pty(e.to_string()))?;
        let mut master_writer = pair
            .master
            .take_writer()
            .map_err(|e| AgentError::Pty(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
        let exited = Arc::new(AtomicBool::new(false));

        let guard = if mirror_local {
            Some(RawModeGuard::enter())
        } else {
            None
        };

        // Master -> local terminal + event tee.
        let tee_tx = event_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut chunk = [0u8; 4096];
            loop {
                let n = match master_reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if mirror_local {
                    let mut out = std::io::stdout();
                    let _ = out.write_all(&chunk[..n]);
                    let _ = out.flush();
                }
                if tee_tx
                    .blocking_send(AgentEvent::PtyChunk(chunk[..n].to_vec()))
                    .is_err()
                {
                    break;
                }
            }
        });

        // Local stdin + remote bytes -> master.
        if mirror_local {
            let stdin_tx = input_tx.clone();
            tokio::task::spawn_blocking(move || {
                let mut stdin = std::io::stdin();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = match stdin.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stdin_tx.blocking_send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            });
        }
        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = input_rx.blocking_recv() {
                if master_writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = master_writer.flush();
            }
        });

        // Reaper: wait for exit, restore the terminal, report the code.
        let wait_exited = exited.clone();
        tokio::task::spawn_blocking(move || {
            let status = child.wait();
            wait_exited.store(true, Ordering::SeqCst);
            drop(guard);
            // Keep the master alive until the child is gone.
            drop(pair.master);
            let code = status.ok().map(|s| s.exit_code() as i32);
            debug!(
                component = "agent",
                event = "agent.exited",
                exit_code = ?code,
                "Terminal agent exited"
            );
            let _ = event_tx.blocking_send(AgentEvent::Exited { code });
        });

        Ok(Self {
            input_tx,
            event_rx: Some(event_rx),
            killer,
            pid,
            exited,
            stop_grace: spec.stop_grace,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.event_rx.take()
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Write bytes (e.g. from a remote client) to the PTY master.
    pub async fn write_bytes(&self, bytes: Vec<u8>) -> Result<(), AgentError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyStopped);
        }
        self.input_tx
            .send(bytes)
            .await
            .map_err(|_| AgentError::AlreadyStopped)
    }

    /// Two-phase stop: interrupt, grace, kill.
    pub async fn stop(&mut self) {
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }
        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.exited.load(Ordering::SeqCst) {
            warn!(
                component = "agent",
                event = "agent.stop.kill",
                pid = ?self.pid,
                "Terminal agent did not exit within grace period, killing"
            );
            let _ = self.killer.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(binary: &str, dir: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            binary: binary.into(),
            cwd: dir.to_path_buf(),
            mode: LaunchMode::New,
            session_id: None,
            prompt: String::new(),
            extra_args: Vec::new(),
            max_line_bytes: 1024 * 1024,
            stop_grace: Duration::from_millis(500),
            session_timeout: None,
            log_dir: dir.to_path_buf(),
            log_prefix: "claude".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pty_output_is_teed_to_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_for("/bin/echo", dir.path());
        spec.extra_args = vec!["pty-hello".to_string()];

        let mut session = TerminalSession::spawn(spec, false).expect("echo spawns on pty");
        let mut rx = session.take_event_rx().unwrap();

        let mut bytes = Vec::new();
        let mut exited = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::PtyChunk(chunk) => bytes.extend_from_slice(&chunk),
                AgentEvent::Exited { .. } => exited = true,
                _ => {}
            }
        }
        assert!(exited);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("pty-hello"), "tee missed output: {text}");
    }
}
