//! Thin wrapper over the `git` CLI for status and diff queries.
//!
//! Output is size-capped; anything beyond the cap is truncated with a
//! visible marker rather than failing the request.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(std::io::Error),
    #[error("git exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub text: String,
    pub truncated: bool,
}

pub struct GitAdapter {
    binary: PathBuf,
    max_output_bytes: usize,
}

impl GitAdapter {
    pub fn new(binary: PathBuf, max_output_kb: usize) -> Self {
        Self {
            binary,
            max_output_bytes: max_output_kb * 1024,
        }
    }

    /// `git status --porcelain=v1 -b`
    pub async fn status(&self, repo: &Path) -> Result<GitOutput, GitError> {
        self.run(repo, &["status", "--porcelain=v1", "-b"]).await
    }

    /// `git diff`, optionally scoped to one path.
    pub async fn diff(&self, repo: &Path, path: Option<&str>) -> Result<GitOutput, GitError> {
        let mut args = vec!["diff"];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        self.run(repo, &args).await
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(
            component = "git",
            event = "git.run",
            args = ?args,
            cwd = %cwd.display(),
            "Running git"
        );
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(GitError::Spawn)?;

        if !output.status.success() {
            return Err(GitError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(cap_output(&output.stdout, self.max_output_bytes))
    }
}

/// Truncate at a UTF-8 boundary and append the marker when over budget.
fn cap_output(bytes: &[u8], max: usize) -> GitOutput {
    if bytes.len() <= max {
        return GitOutput {
            text: String::from_utf8_lossy(bytes).into_owned(),
            truncated: false,
        };
    }
    let text = String::from_utf8_lossy(&bytes[..max]);
    let safe_end = (0..=text.len())
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    GitOutput {
        text: format!("{}{}", &text[..safe_end], TRUNCATION_MARKER),
        truncated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_output_is_untouched() {
        let out = cap_output(b"clean tree\n", 1024);
        assert!(!out.truncated);
        assert_eq!(out.text, "clean tree\n");
    }

    #[test]
    fn oversized_output_gets_marker() {
        let big = vec![b'a'; 2048];
        let out = cap_output(&big, 100);
        assert!(out.truncated);
        assert!(out.text.ends_with(TRUNCATION_MARKER));
        assert!(out.text.len() <= 100 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn status_works_in_a_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        let ok = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            return; // git unavailable in this environment
        }

        let adapter = GitAdapter::new(PathBuf::from("git"), 256);
        let out = adapter.status(dir.path()).await.unwrap();
        assert!(out.text.starts_with("##"));
    }

    #[tokio::test]
    async fn failure_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = GitAdapter::new(PathBuf::from("git"), 256);
        // Not a repository: git exits non-zero.
        match adapter.diff(dir.path(), None).await {
            Err(GitError::Failed { .. }) | Err(GitError::Spawn(_)) => {}
            Ok(_) => panic!("diff in a non-repo should fail"),
        }
    }
}
