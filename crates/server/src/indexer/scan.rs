//! Index mutations: full scans and watcher-driven incremental updates.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use ring::digest::{digest, SHA256};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use cdev_protocol::now_rfc3339;

use super::db;
use super::{
    hex_encode, is_binary_extension, IndexError, IndexerInner, ScanSummary, CONTENT_SCAN_MAX_BYTES,
};

const PROGRESS_EVERY: u64 = 1000;

/// One row ready for insertion.
pub(crate) struct FileRow {
    pub rel_path: String,
    pub name: String,
    pub extension: String,
    pub directory: String,
    pub size: i64,
    pub modified_at: i64,
    pub is_binary: bool,
    pub is_symlink: bool,
    pub is_sensitive: bool,
    pub git_tracked: bool,
    pub git_ignored: bool,
    pub content_hash: Option<String>,
    pub line_count: Option<i64>,
    pub file_id: i64,
}

/// Repo-relative paths known to git, loaded once per full scan.
pub(crate) struct GitFileSets {
    tracked: HashSet<String>,
    ignored: HashSet<String>,
}

impl GitFileSets {
    fn status(&self, rel_path: &str) -> (bool, bool) {
        (
            self.tracked.contains(rel_path),
            self.ignored.contains(rel_path),
        )
    }
}

/// Ask git for the tracked and ignored file sets. `None` when the root
/// is not a git repository or the binary is unavailable; every row then
/// carries `false` for both flags.
fn load_git_sets(git_binary: &Path, repo_root: &Path) -> Option<GitFileSets> {
    let tracked = run_git_z(git_binary, repo_root, &["ls-files", "-z"])?;
    let ignored = run_git_z(
        git_binary,
        repo_root,
        &["ls-files", "-z", "--others", "--ignored", "--exclude-standard"],
    )?;
    Some(GitFileSets { tracked, ignored })
}

fn run_git_z(git_binary: &Path, repo_root: &Path, args: &[&str]) -> Option<HashSet<String>> {
    let output = std::process::Command::new(git_binary)
        .args(args)
        .current_dir(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(
        output
            .stdout
            .split(|&b| b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect(),
    )
}

/// Per-file git status for incremental updates, where loading the full
/// sets would cost more than two targeted queries.
fn git_file_status(git_binary: &Path, repo_root: &Path, rel_path: &str) -> (bool, bool) {
    let run = |args: &[&str]| {
        std::process::Command::new(git_binary)
            .args(args)
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    };
    let tracked = run(&["ls-files", "--error-unmatch", "--", rel_path]);
    let ignored = !tracked && run(&["check-ignore", "-q", "--", rel_path]);
    (tracked, ignored)
}

/// Metadata-scan one file. Small non-binary files are hashed and
/// line-counted in a single read pass. A symlink pointing outside the
/// repository root is marked sensitive rather than followed.
/// `git_status` is `(tracked, ignored)` as resolved by the caller.
pub(crate) fn scan_file(
    inner: &IndexerInner,
    absolute: &Path,
    rel_path: &str,
    git_status: (bool, bool),
) -> Result<FileRow, IndexError> {
    let meta = std::fs::symlink_metadata(absolute)?;
    let is_symlink = meta.file_type().is_symlink();

    let name = Path::new(rel_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel_path.to_string());
    let extension = Path::new(rel_path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let directory = Path::new(rel_path)
        .parent()
        .map(|d| d.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();

    let mut is_sensitive = inner.is_sensitive_name(&name);
    let is_binary = is_binary_extension(&extension);

    if is_symlink {
        let escapes = match std::fs::canonicalize(absolute) {
            Ok(target) => !target.starts_with(&inner.repo_root),
            // Broken symlink: treat as escaping, never follow.
            Err(_) => true,
        };
        if escapes {
            is_sensitive = true;
        }
    }

    let size = meta.len() as i64;
    let modified_at = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let (content_hash, line_count) = if !is_symlink
        && !is_binary
        && meta.len() < CONTENT_SCAN_MAX_BYTES
        && meta.is_file()
    {
        match std::fs::read(absolute) {
            Ok(bytes) => {
                let hash = hex_encode(digest(&SHA256, &bytes).as_ref());
                let lines = bytes.iter().filter(|&&b| b == b'\n').count() as i64;
                (Some(hash), Some(lines))
            }
            Err(e) => {
                debug!(
                    component = "indexer",
                    event = "indexer.content_read_failed",
                    path = %absolute.display(),
                    error = %e,
                    "Skipping content scan"
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let file_id = if is_symlink { 0 } else { (inner.file_id_fn)(&meta) as i64 };
    let (git_tracked, git_ignored) = git_status;

    Ok(FileRow {
        rel_path: rel_path.to_string(),
        name,
        extension,
        directory,
        size,
        modified_at,
        is_binary,
        is_symlink,
        is_sensitive,
        git_tracked,
        git_ignored,
        content_hash,
        line_count,
        file_id,
    })
}

fn insert_row(conn: &Connection, row: &FileRow, now: i64) -> rusqlite::Result<i64> {
    conn.prepare_cached(
        "INSERT INTO files (path, path_normalized, name, extension, directory, size,
                            modified_at, indexed_at, is_binary, is_symlink, is_sensitive,
                            git_tracked, git_ignored, content_hash, line_count, file_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
    )?
    .execute(params![
        row.rel_path,
        row.rel_path.to_lowercase(),
        row.name,
        row.extension,
        row.directory,
        row.size,
        row.modified_at,
        now,
        row.is_binary as i64,
        row.is_symlink as i64,
        row.is_sensitive as i64,
        row.git_tracked as i64,
        row.git_ignored as i64,
        row.content_hash,
        row.line_count,
        row.file_id,
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Remove a row and its FTS shadow. External-content FTS5 requires the
/// original column values in the delete command.
fn delete_row(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    let found: Option<(String, String, String)> = conn
        .prepare_cached("SELECT path, name, directory FROM files WHERE id = ?1")?
        .query_row(params![id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .optional()?;
    if let Some((path, name, directory)) = found {
        conn.prepare_cached(
            "INSERT INTO files_fts (files_fts, rowid, path, name, directory)
             VALUES ('delete', ?1, ?2, ?3, ?4)",
        )?
        .execute(params![id, path, name, directory])?;
        conn.prepare_cached("DELETE FROM files WHERE id = ?1")?
            .execute(params![id])?;
    }
    Ok(())
}

fn insert_fts(conn: &Connection, id: i64, row: &FileRow) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO files_fts (rowid, path, name, directory) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![id, row.rel_path, row.name, row.directory])?;
    Ok(())
}

/// Rebuild the whole index inside one transaction; the FTS index is
/// rebuilt after commit. Cap or deadline violations degrade the scan
/// (partial data is kept) instead of failing it.
pub(crate) fn full_scan_blocking(inner: &IndexerInner) -> Result<ScanSummary, IndexError> {
    let started = Instant::now();
    let deadline = started + std::time::Duration::from_secs(inner.config.scan_timeout_secs.max(1));
    let now = chrono::Utc::now().timestamp();

    let mut scanned: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut degraded: Option<String> = None;

    let git_sets = load_git_sets(&inner.git_binary, &inner.repo_root);

    let mut conn = inner.writer.lock().expect("indexer writer poisoned");
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM files", [])?;
    tx.execute("DELETE FROM directory_stats", [])?;

    let walker = WalkDir::new(&inner.repo_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                // Hidden and configured directories are skipped outright.
                if name.starts_with('.') {
                    return false;
                }
                if inner.skip_dirs.iter().any(|d| d.as_str() == name) {
                    return false;
                }
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(
                    component = "indexer",
                    event = "indexer.walk_error",
                    error = %e,
                    "Skipping unreadable entry"
                );
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        if Instant::now() > deadline {
            degraded = Some("scan_timeout".to_string());
            break;
        }
        if scanned >= inner.config.max_files {
            degraded = Some(format!("too_many_files: limit {}", inner.config.max_files));
            break;
        }

        let rel = match entry.path().strip_prefix(&inner.repo_root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let git_status = git_sets
            .as_ref()
            .map(|sets| sets.status(&rel))
            .unwrap_or((false, false));
        let row = match scan_file(inner, entry.path(), &rel, git_status) {
            Ok(row) => row,
            Err(e) => {
                debug!(
                    component = "indexer",
                    event = "indexer.scan_file_failed",
                    path = %rel,
                    error = %e,
                    "Skipping file"
                );
                continue;
            }
        };

        total_bytes += row.size.max(0) as u64;
        if total_bytes > inner.config.max_total_bytes {
            degraded = Some(format!(
                "index_too_large: limit {} bytes",
                inner.config.max_total_bytes
            ));
            break;
        }

        insert_row(&tx, &row, now)?;
        scanned += 1;

        if scanned % PROGRESS_EVERY == 0 {
            inner.publish_progress(scanned, total_bytes, false, None);
        }
    }

    tx.execute(
        "INSERT INTO directory_stats (path, file_count, total_size, last_modified, indexed_at)
         SELECT directory, COUNT(*), COALESCE(SUM(size), 0), COALESCE(MAX(modified_at), 0), ?1
         FROM files GROUP BY directory",
        params![now],
    )?;
    db::set_meta(&tx, "last_scan_at", &now_rfc3339())?;
    tx.commit()?;

    // External-content FTS: rebuild from the base table after commit.
    conn.execute("INSERT INTO files_fts (files_fts) VALUES ('rebuild')", [])?;
    drop(conn);

    inner.publish_progress(scanned, total_bytes, true, degraded.clone());
    if let Some(reason) = &degraded {
        warn!(
            component = "indexer",
            event = "indexer.scan_degraded",
            scanned = scanned,
            reason = %reason,
            "Full scan degraded, partial data retained"
        );
    } else {
        info!(
            component = "indexer",
            event = "indexer.scan_complete",
            scanned = scanned,
            total_bytes = total_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Full scan complete"
        );
    }

    Ok(ScanSummary {
        scanned,
        total_bytes,
        degraded,
    })
}

/// Incremental upsert. Rename detection: when another row carries the
/// same non-zero `file_id` at a different path, that row is deleted
/// before insert, so a rename never yields two rows.
pub(crate) fn index_file_blocking(inner: &IndexerInner, path: &Path) -> Result<(), IndexError> {
    let (absolute, rel) = inner.validate_path(path)?;
    if !absolute.exists() && std::fs::symlink_metadata(&absolute).is_err() {
        return remove_by_rel(inner, &rel);
    }
    let git_status = git_file_status(&inner.git_binary, &inner.repo_root, &rel);
    let row = scan_file(inner, &absolute, &rel, git_status)?;
    let now = chrono::Utc::now().timestamp();

    let mut conn = inner.writer.lock().expect("indexer writer poisoned");
    let tx = conn.transaction()?;

    if row.file_id > 0 {
        let stale: Vec<i64> = {
            let mut stmt = tx
                .prepare_cached("SELECT id FROM files WHERE file_id = ?1 AND path <> ?2")?;
            let ids = stmt
                .query_map(params![row.file_id, row.rel_path], |r| r.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            ids
        };
        for id in stale {
            delete_row(&tx, id)?;
        }
    }

    let existing: Option<i64> = tx
        .prepare_cached("SELECT id FROM files WHERE path = ?1")?
        .query_row(params![row.rel_path], |r| r.get(0))
        .optional()?;
    if let Some(id) = existing {
        delete_row(&tx, id)?;
    }

    let id = insert_row(&tx, &row, now)?;
    insert_fts(&tx, id, &row)?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn remove_file_blocking(inner: &IndexerInner, path: &Path) -> Result<(), IndexError> {
    let (_absolute, rel) = inner.validate_path(path)?;
    remove_by_rel(inner, &rel)
}

fn remove_by_rel(inner: &IndexerInner, rel: &str) -> Result<(), IndexError> {
    let mut conn = inner.writer.lock().expect("indexer writer poisoned");
    let tx = conn.transaction()?;
    let existing: Option<i64> = tx
        .prepare_cached("SELECT id FROM files WHERE path = ?1")?
        .query_row(params![rel], |r| r.get(0))
        .optional()?;
    if let Some(id) = existing {
        delete_row(&tx, id)?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_indexer;
    use super::*;
    use cdev_protocol::SearchMode;

    use crate::indexer::search::SearchOptions;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn fuzzy(query: &str) -> SearchOptions {
        SearchOptions {
            mode: SearchMode::Fuzzy,
            query: query.to_string(),
            limit: 10,
            offset: 0,
            include_binary: true,
            include_sensitive: true,
        }
    }

    #[tokio::test]
    async fn full_scan_indexes_files_and_skips_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}\n");
        write(dir.path(), "README.md", "# readme\n");
        write(dir.path(), "node_modules/x/index.js", "ignored\n");
        write(dir.path(), ".hidden/secret.txt", "ignored\n");

        let indexer = test_indexer(dir.path());
        let summary = indexer.full_scan().await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert!(summary.degraded.is_none());

        let hits = indexer.search(fuzzy("main")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/main.rs");
        assert_eq!(hits[0].line_count, Some(1));
        assert!(hits[0].content_hash.is_some());
    }

    #[tokio::test]
    async fn rename_yields_exactly_one_row() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "same content\n");

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();
        let before = indexer.search(fuzzy("a.txt")).await.unwrap();
        assert_eq!(before.len(), 1);
        let original_hash = before[0].content_hash.clone();

        // Rename keeps the inode, so file_id-based detection kicks in.
        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        indexer
            .index_file(dir.path().join("b.txt"))
            .await
            .unwrap();

        assert!(indexer.search(fuzzy("a.txt")).await.unwrap().is_empty());
        let after = indexer.search(fuzzy("b.txt")).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].path, "b.txt");
        assert_eq!(after[0].content_hash, original_hash);
    }

    #[tokio::test]
    async fn reindexing_same_path_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.rs", "one\n");

        let indexer = test_indexer(dir.path());
        indexer.index_file(dir.path().join("x.rs")).await.unwrap();
        write(dir.path(), "x.rs", "one\ntwo\n");
        indexer.index_file(dir.path().join("x.rs")).await.unwrap();

        let hits = indexer.search(fuzzy("x.rs")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line_count, Some(2));
    }

    #[tokio::test]
    async fn remove_file_deletes_row() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "gone.txt", "bye\n");

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();
        indexer
            .remove_file(dir.path().join("gone.txt"))
            .await
            .unwrap();
        assert!(indexer.search(fuzzy("gone.txt")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn symlink_outside_repo_is_marked_sensitive_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "target.txt", "outside\n");
        std::os::unix::fs::symlink(outside.path().join("target.txt"), dir.path().join("link.txt"))
            .unwrap();

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();

        let hits = indexer.search(fuzzy("link.txt")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_sensitive);
        // Content was not read through the link.
        assert!(hits[0].content_hash.is_none());
    }

    #[tokio::test]
    async fn scan_cap_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write(dir.path(), &format!("f{i}.txt"), "x\n");
        }

        let mut config = crate::config::IndexerConfig::default();
        config.max_files = 3;
        let indexer = crate::indexer::Indexer::open(
            dir.path(),
            &dir.path().join("capped.db"),
            config,
            vec![],
            std::path::PathBuf::from("git"),
            crate::hub::EventHub::new(16),
            "ws".to_string(),
        )
        .unwrap();

        let summary = indexer.full_scan().await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert!(summary.degraded.unwrap().contains("too_many_files"));
        assert!(indexer.error_message().is_some());
    }

    #[tokio::test]
    async fn git_tracked_and_ignored_flags() {
        let dir = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        };
        if !git(&["init", "-q"]) {
            return; // git unavailable in this environment
        }

        write(dir.path(), "tracked.rs", "fn t() {}\n");
        write(dir.path(), "untracked.rs", "fn u() {}\n");
        write(dir.path(), "build.log", "noise\n");
        write(dir.path(), ".gitignore", "*.log\n");
        assert!(git(&["add", "tracked.rs", ".gitignore"]));

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();

        let by_path = |path: &str| {
            let indexer = indexer.clone();
            let path = path.to_string();
            async move {
                indexer
                    .search(SearchOptions {
                        mode: SearchMode::Exact,
                        query: path,
                        limit: 10,
                        offset: 0,
                        include_binary: true,
                        include_sensitive: true,
                    })
                    .await
                    .unwrap()
                    .remove(0)
            }
        };

        let tracked = by_path("tracked.rs").await;
        assert!(tracked.git_tracked);
        assert!(!tracked.git_ignored);

        let untracked = by_path("untracked.rs").await;
        assert!(!untracked.git_tracked);
        assert!(!untracked.git_ignored);

        let ignored = by_path("build.log").await;
        assert!(!ignored.git_tracked);
        assert!(ignored.git_ignored);

        // Incremental updates resolve status per file.
        write(dir.path(), "fresh.log", "more noise\n");
        indexer.index_file(dir.path().join("fresh.log")).await.unwrap();
        let fresh = by_path("fresh.log").await;
        assert!(fresh.git_ignored);

        write(dir.path(), "new.rs", "fn n() {}\n");
        assert!(git(&["add", "new.rs"]));
        indexer.index_file(dir.path().join("new.rs")).await.unwrap();
        assert!(by_path("new.rs").await.git_tracked);
    }

    #[tokio::test]
    async fn scans_outside_git_default_both_flags_false() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "plain.txt", "x\n");

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();
        let hits = indexer.search(fuzzy("plain.txt")).await.unwrap();
        assert!(!hits[0].git_tracked);
        assert!(!hits[0].git_ignored);
    }

    #[tokio::test]
    async fn sensitive_files_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "conf/.env.production", "SECRET=1\n");

        let indexer = test_indexer(dir.path());
        indexer.full_scan().await.unwrap();
        let hits = indexer.search(fuzzy("env")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_sensitive);
    }
}
