//! Read-side queries: search, listing, tree and stats.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, Row};

use cdev_protocol::{IndexStats, SearchMode, SearchResult, TreeNode};

use super::{db, IndexError, IndexerInner};

const TOP_LARGEST: usize = 10;
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub query: String,
    pub limit: usize,
    pub offset: usize,
    pub include_binary: bool,
    pub include_sensitive: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Fuzzy,
            query: String::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            include_binary: false,
            include_sensitive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    Size,
    Modified,
    Path,
}

impl SortBy {
    fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Size => "size",
            Self::Modified => "modified_at",
            Self::Path => "path",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Repo-relative directory; empty string lists the root.
    pub directory: String,
    pub recursive: bool,
    pub sort: SortBy,
    pub descending: bool,
    pub extension: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            directory: String::new(),
            recursive: false,
            sort: SortBy::Name,
            descending: false,
            extension: None,
            min_size: None,
            max_size: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

const RESULT_COLUMNS: &str = "path, name, directory, size, modified_at, is_binary, is_sensitive, \
                              git_tracked, git_ignored, content_hash, line_count";

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<SearchResult> {
    Ok(SearchResult {
        path: row.get(0)?,
        name: row.get(1)?,
        directory: row.get(2)?,
        size: row.get(3)?,
        modified_at: row.get(4)?,
        is_binary: row.get::<_, i64>(5)? != 0,
        is_sensitive: row.get::<_, i64>(6)? != 0,
        git_tracked: row.get::<_, i64>(7)? != 0,
        git_ignored: row.get::<_, i64>(8)? != 0,
        content_hash: row.get(9)?,
        line_count: row.get(10)?,
    })
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIMIT)
}

/// Build an FTS5 match expression from free text: each token becomes a
/// quoted prefix term, so user input can never inject FTS syntax.
fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "")))
        .filter(|t| t.len() > 3)
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(terms.join(" "))
}

pub(crate) fn search_blocking(
    inner: &IndexerInner,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>, IndexError> {
    let conn = inner.reader.lock().expect("indexer reader poisoned");
    let limit = clamp_limit(options.limit) as i64;
    let offset = options.offset as i64;
    let include_binary = options.include_binary as i64;
    let include_sensitive = options.include_sensitive as i64;

    let results = match options.mode {
        SearchMode::Fuzzy => {
            let Some(match_expr) = fts_query(&options.query) else {
                return Ok(Vec::new());
            };
            // `rank` is FTS5's built-in BM25 ordering.
            let columns: String = RESULT_COLUMNS
                .split(", ")
                .map(|c| format!("f.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {columns} FROM files_fts
                 JOIN files f ON f.id = files_fts.rowid
                 WHERE files_fts MATCH ?1
                   AND (?2 OR f.is_binary = 0)
                   AND (?3 OR f.is_sensitive = 0)
                 ORDER BY rank LIMIT ?4 OFFSET ?5"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![match_expr, include_binary, include_sensitive, limit, offset],
                row_to_result,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        SearchMode::Exact => {
            let sql = format!(
                "SELECT {RESULT_COLUMNS} FROM files
                 WHERE instr(path_normalized, ?1) > 0
                   AND (?2 OR is_binary = 0)
                   AND (?3 OR is_sensitive = 0)
                 ORDER BY path LIMIT ?4 OFFSET ?5"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![
                    options.query.to_lowercase(),
                    include_binary,
                    include_sensitive,
                    limit,
                    offset
                ],
                row_to_result,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        SearchMode::Prefix => {
            let needle = options.query.to_lowercase();
            let sql = format!(
                "SELECT {RESULT_COLUMNS} FROM files
                 WHERE substr(path_normalized, 1, length(?1)) = ?1
                   AND (?2 OR is_binary = 0)
                   AND (?3 OR is_sensitive = 0)
                 ORDER BY path LIMIT ?4 OFFSET ?5"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![needle, include_binary, include_sensitive, limit, offset],
                row_to_result,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        SearchMode::Extension => {
            let ext = options
                .query
                .trim_start_matches('.')
                .to_ascii_lowercase();
            let sql = format!(
                "SELECT {RESULT_COLUMNS} FROM files
                 WHERE extension = ?1
                   AND (?2 OR is_binary = 0)
                   AND (?3 OR is_sensitive = 0)
                 ORDER BY path LIMIT ?4 OFFSET ?5"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![ext, include_binary, include_sensitive, limit, offset],
                row_to_result,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(results)
}

pub(crate) fn list_blocking(
    inner: &IndexerInner,
    options: &ListOptions,
) -> Result<Vec<SearchResult>, IndexError> {
    let conn = inner.reader.lock().expect("indexer reader poisoned");
    let limit = clamp_limit(options.limit) as i64;
    let offset = options.offset as i64;

    let dir_clause = if options.recursive {
        "(?1 = '' OR directory = ?1 OR directory LIKE ?1 || '/%')"
    } else {
        "directory = ?1"
    };
    let order = format!(
        "{} {}",
        options.sort.column(),
        if options.descending { "DESC" } else { "ASC" }
    );
    let sql = format!(
        "SELECT {RESULT_COLUMNS} FROM files
         WHERE {dir_clause}
           AND (?2 IS NULL OR extension = ?2)
           AND (?3 IS NULL OR size >= ?3)
           AND (?4 IS NULL OR size <= ?4)
         ORDER BY {order} LIMIT ?5 OFFSET ?6"
    );

    let extension = options
        .extension
        .as_ref()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase());
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![
            options.directory,
            extension,
            options.min_size,
            options.max_size,
            limit,
            offset
        ],
        row_to_result,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Depth-bounded tree rooted at `root` (repo-relative, "" = repo root),
/// files and subdirectories interleaved (directories first per level,
/// both name-sorted).
pub(crate) fn tree_blocking(
    inner: &IndexerInner,
    root: &str,
    depth: usize,
) -> Result<TreeNode, IndexError> {
    let conn = inner.reader.lock().expect("indexer reader poisoned");
    let root = root.trim_matches('/');

    let (sql, prefix) = if root.is_empty() {
        (
            "SELECT path, size FROM files ORDER BY path".to_string(),
            String::new(),
        )
    } else {
        (
            "SELECT path, size FROM files WHERE path LIKE ?1 || '/%' ORDER BY path".to_string(),
            root.to_string(),
        )
    };

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows: Vec<(String, i64)> = if prefix.is_empty() {
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    } else {
        stmt.query_map(params![prefix], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };
    drop(stmt);
    drop(conn);

    #[derive(Default)]
    struct DirNode {
        dirs: BTreeMap<String, DirNode>,
        files: BTreeMap<String, i64>,
    }

    let mut top = DirNode::default();
    let skip = if root.is_empty() { 0 } else { root.split('/').count() };
    for (path, size) in rows {
        let components: Vec<&str> = path.split('/').skip(skip).collect();
        let Some((file_name, dirs)) = components.split_last() else {
            continue;
        };
        if dirs.len() >= depth.max(1) {
            // Beyond the requested depth: surface the ancestor directory
            // but not its contents.
            let mut node = &mut top;
            for dir in dirs.iter().take(depth.max(1)) {
                node = node.dirs.entry(dir.to_string()).or_default();
            }
            continue;
        }
        let mut node = &mut top;
        for dir in dirs {
            node = node.dirs.entry(dir.to_string()).or_default();
        }
        node.files.insert(file_name.to_string(), size);
    }

    fn convert(name: &str, path: &str, node: DirNode) -> TreeNode {
        let mut children = Vec::new();
        for (dir_name, dir_node) in node.dirs {
            let child_path = if path.is_empty() {
                dir_name.clone()
            } else {
                format!("{path}/{dir_name}")
            };
            children.push(convert(&dir_name, &child_path, dir_node));
        }
        for (file_name, size) in node.files {
            let child_path = if path.is_empty() {
                file_name.clone()
            } else {
                format!("{path}/{file_name}")
            };
            children.push(TreeNode {
                name: file_name,
                path: child_path,
                is_dir: false,
                size: Some(size),
                children: Vec::new(),
            });
        }
        TreeNode {
            name: name.to_string(),
            path: path.to_string(),
            is_dir: true,
            size: None,
            children,
        }
    }

    let name = if root.is_empty() {
        inner
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        root.rsplit('/').next().unwrap_or(root).to_string()
    };
    Ok(convert(&name, root, top))
}

pub(crate) fn stats_blocking(inner: &IndexerInner) -> Result<IndexStats, IndexError> {
    let conn = inner.reader.lock().expect("indexer reader poisoned");

    let (file_count, total_size, binary_count, sensitive_count): (i64, i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0),
                    COALESCE(SUM(is_binary), 0), COALESCE(SUM(is_sensitive), 0)
             FROM files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let sql = format!(
        "SELECT {RESULT_COLUMNS} FROM files ORDER BY size DESC, path LIMIT {TOP_LARGEST}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let largest_files = stmt
        .query_map([], row_to_result)?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let last_scan_at = db::get_meta(&conn, "last_scan_at")?;

    Ok(IndexStats {
        file_count,
        total_size,
        binary_count,
        sensitive_count,
        largest_files,
        last_scan_at,
        error_message: None,
    })
}
