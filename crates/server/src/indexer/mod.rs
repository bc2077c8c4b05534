//! Repository indexer: a SQLite+FTS5 file index with rename detection
//! and incremental updates.
//!
//! The indexer exclusively owns its database file. All SQLite access
//! happens on blocking threads; the async surface is thin wrappers. One
//! writer connection serialises mutations; readers use a separate
//! connection. A stats cache is invalidated on every write, with a TTL
//! as the final fallback.

mod db;
mod scan;
mod search;

pub use search::{ListOptions, SearchOptions, SortBy};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use rusqlite::Connection;
use tracing::{info, warn};

use cdev_protocol::{EventKind, IndexStats, SearchResult, TreeNode};

use crate::config::IndexerConfig;
use crate::hub::EventHub;

/// Indexer failures. Validation errors map to 400s; the rest are 500s.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("path_traversal: {0}")]
    PathTraversal(String),
    #[error("symlink_outside_repo: {0}")]
    SymlinkOutsideRepo(String),
    #[error("too_many_files: limit {0}")]
    TooManyFiles(u64),
    #[error("index_too_large: limit {0} bytes")]
    IndexTooLarge(u64),
    #[error("scan_timeout")]
    ScanTimeout,
    #[error("invalid_path: {0}")]
    InvalidPath(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task error: {0}")]
    Task(String),
}

/// Result of a full scan. A degraded scan retains partial data and
/// carries the reason.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub scanned: u64,
    pub total_bytes: u64,
    pub degraded: Option<String>,
}

/// Injected capability returning the platform-stable file identifier
/// (inode on POSIX). `0` means "not available" and disables rename
/// detection for that file.
pub type FileIdFn = fn(&std::fs::Metadata) -> u64;

#[cfg(unix)]
pub fn platform_file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
pub fn platform_file_id(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Extensions treated as binary without content inspection.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "pdf", "zip", "tar", "gz", "bz2", "xz",
    "7z", "exe", "dll", "so", "dylib", "a", "o", "class", "jar", "wasm", "bin", "dat", "sqlite",
    "db", "mp3", "mp4", "mov", "avi", "mkv", "woff", "woff2", "ttf", "otf", "eot",
];

/// Credential-like file names flagged as sensitive. Name-based only; no
/// content inspection.
const SENSITIVE_GLOBS: &[&str] = &[
    ".env*",
    "*.pem",
    "*.key",
    "id_rsa*",
    "id_ed25519*",
    "*.p12",
    "credentials*",
    "secrets*",
];

/// Files below this size are hashed and line-counted in one read pass.
pub(crate) const CONTENT_SCAN_MAX_BYTES: u64 = 1024 * 1024;

pub(crate) struct IndexerInner {
    pub repo_root: PathBuf,
    pub config: IndexerConfig,
    pub skip_dirs: Vec<String>,
    pub git_binary: PathBuf,
    pub writer: Mutex<Connection>,
    pub reader: Mutex<Connection>,
    pub file_id_fn: FileIdFn,
    pub sensitive: GlobSet,
    pub hub: EventHub,
    pub workspace_id: String,
    pub stats_cache: Mutex<Option<(IndexStats, Instant)>>,
    pub error_message: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct Indexer {
    inner: Arc<IndexerInner>,
}

impl Indexer {
    /// Open (or create) the index for `repo_root`.
    pub fn open(
        repo_root: &Path,
        db_path: &Path,
        config: IndexerConfig,
        skip_dirs: Vec<String>,
        git_binary: PathBuf,
        hub: EventHub,
        workspace_id: String,
    ) -> anyhow::Result<Self> {
        Self::open_with_file_id(
            repo_root,
            db_path,
            config,
            skip_dirs,
            git_binary,
            hub,
            workspace_id,
            platform_file_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_with_file_id(
        repo_root: &Path,
        db_path: &Path,
        config: IndexerConfig,
        skip_dirs: Vec<String>,
        git_binary: PathBuf,
        hub: EventHub,
        workspace_id: String,
        file_id_fn: FileIdFn,
    ) -> anyhow::Result<Self> {
        let repo_root = repo_root.canonicalize()?;
        let writer = db::open_connection(db_path)?;
        db::init_schema(&writer)?;
        let reader = db::open_connection(db_path)?;

        let mut builder = GlobSetBuilder::new();
        for pattern in SENSITIVE_GLOBS {
            builder.add(Glob::new(pattern).expect("static glob is valid"));
        }

        info!(
            component = "indexer",
            event = "indexer.opened",
            repo = %repo_root.display(),
            db = %db_path.display(),
            "Index database opened"
        );

        Ok(Self {
            inner: Arc::new(IndexerInner {
                repo_root,
                config,
                skip_dirs,
                git_binary,
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                file_id_fn,
                sensitive: builder.build().expect("static globset builds"),
                hub,
                workspace_id,
                stats_cache: Mutex::new(None),
                error_message: Mutex::new(None),
            }),
        })
    }

    /// Walk the repository and rebuild the index inside one transaction.
    pub async fn full_scan(&self) -> Result<ScanSummary, IndexError> {
        let inner = self.inner.clone();
        let summary = run_blocking(move || scan::full_scan_blocking(&inner)).await?;
        self.invalidate_stats();
        *self.inner.error_message.lock().expect("error msg poisoned") = summary.degraded.clone();
        Ok(summary)
    }

    /// Incrementally index one file (watcher-triggered).
    pub async fn index_file(&self, path: PathBuf) -> Result<(), IndexError> {
        let inner = self.inner.clone();
        run_blocking(move || scan::index_file_blocking(&inner, &path)).await?;
        self.invalidate_stats();
        Ok(())
    }

    /// Remove one file's row.
    pub async fn remove_file(&self, path: PathBuf) -> Result<(), IndexError> {
        let inner = self.inner.clone();
        run_blocking(move || scan::remove_file_blocking(&inner, &path)).await?;
        self.invalidate_stats();
        Ok(())
    }

    pub async fn search(&self, options: SearchOptions) -> Result<Vec<SearchResult>, IndexError> {
        let inner = self.inner.clone();
        run_blocking(move || search::search_blocking(&inner, &options)).await
    }

    pub async fn list_files(&self, options: ListOptions) -> Result<Vec<SearchResult>, IndexError> {
        let inner = self.inner.clone();
        run_blocking(move || search::list_blocking(&inner, &options)).await
    }

    /// Depth-bounded hierarchical view rooted at `root` (repo-relative).
    pub async fn get_tree(&self, root: String, depth: usize) -> Result<TreeNode, IndexError> {
        let inner = self.inner.clone();
        run_blocking(move || search::tree_blocking(&inner, &root, depth)).await
    }

    /// Aggregate stats, cached until a write or the TTL.
    pub async fn get_stats(&self) -> Result<IndexStats, IndexError> {
        let ttl = Duration::from_secs(self.inner.config.stats_ttl_secs);
        {
            let cache = self.inner.stats_cache.lock().expect("stats cache poisoned");
            if let Some((stats, at)) = cache.as_ref() {
                if at.elapsed() < ttl {
                    return Ok(stats.clone());
                }
            }
        }

        let inner = self.inner.clone();
        let mut stats = run_blocking(move || search::stats_blocking(&inner)).await?;
        stats.error_message = self.error_message();

        let mut cache = self.inner.stats_cache.lock().expect("stats cache poisoned");
        *cache = Some((stats.clone(), Instant::now()));
        Ok(stats)
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner
            .error_message
            .lock()
            .expect("error msg poisoned")
            .clone()
    }

    /// Checkpoint and release the database (shutdown path).
    pub fn close(&self) {
        if let Ok(writer) = self.inner.writer.lock() {
            if let Err(e) = writer.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!(
                    component = "indexer",
                    event = "indexer.checkpoint_failed",
                    error = %e,
                    "WAL checkpoint failed on close"
                );
            }
        }
    }

    fn invalidate_stats(&self) {
        *self.inner.stats_cache.lock().expect("stats cache poisoned") = None;
    }

    #[cfg(test)]
    pub(crate) fn repo_root(&self) -> &Path {
        &self.inner.repo_root
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, IndexError> + Send + 'static,
) -> Result<T, IndexError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IndexError::Task(e.to_string()))?
}

impl IndexerInner {
    /// Validate a repo path: no null bytes, no `..`, must stay inside
    /// the repository root. Returns `(absolute, repo-relative string)`.
    pub(crate) fn validate_path(&self, path: &Path) -> Result<(PathBuf, String), IndexError> {
        let raw = path.to_string_lossy();
        if raw.contains('\0') {
            return Err(IndexError::InvalidPath("null byte in path".into()));
        }
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(IndexError::PathTraversal(raw.into_owned()));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        };
        let rel = absolute
            .strip_prefix(&self.repo_root)
            .map_err(|_| IndexError::PathTraversal(raw.clone().into_owned()))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rel_str.is_empty() {
            return Err(IndexError::InvalidPath("empty path".into()));
        }
        Ok((absolute, rel_str))
    }

    pub(crate) fn is_sensitive_name(&self, name: &str) -> bool {
        self.sensitive.is_match(name)
    }

    pub(crate) fn publish_progress(
        &self,
        scanned: u64,
        total_bytes: u64,
        done: bool,
        error_message: Option<String>,
    ) {
        self.hub.publish(
            self.workspace_id.clone(),
            EventKind::IndexProgress {
                scanned,
                total_bytes,
                done,
                error_message,
            },
        );
    }
}

pub(crate) fn is_binary_extension(extension: &str) -> bool {
    BINARY_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;

    pub(crate) fn test_indexer(dir: &Path) -> Indexer {
        Indexer::open(
            dir,
            &dir.join("index-test.db"),
            IndexerConfig::default(),
            vec![".git".to_string(), "node_modules".to_string()],
            PathBuf::from("git"),
            EventHub::new(64),
            "ws-test".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn path_validation_rejects_traversal_null_and_escape() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = test_indexer(dir.path());
        let inner = &indexer.inner;

        assert!(matches!(
            inner.validate_path(Path::new("src/../../etc/passwd")),
            Err(IndexError::PathTraversal(_))
        ));
        assert!(matches!(
            inner.validate_path(Path::new("src/a\0b")),
            Err(IndexError::InvalidPath(_))
        ));
        assert!(matches!(
            inner.validate_path(Path::new("/etc/passwd")),
            Err(IndexError::PathTraversal(_))
        ));

        let (abs, rel) = inner.validate_path(Path::new("src/main.rs")).unwrap();
        assert!(abs.starts_with(indexer.repo_root()));
        assert_eq!(rel, "src/main.rs");
    }

    #[test]
    fn binary_and_sensitive_detection() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = test_indexer(dir.path());

        assert!(is_binary_extension("PNG"));
        assert!(is_binary_extension("so"));
        assert!(!is_binary_extension("rs"));

        let inner = &indexer.inner;
        assert!(inner.is_sensitive_name(".env"));
        assert!(inner.is_sensitive_name(".env.local"));
        assert!(inner.is_sensitive_name("server.key"));
        assert!(inner.is_sensitive_name("id_rsa.pub"));
        assert!(!inner.is_sensitive_name("main.rs"));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
