//! Index database: schema and connection setup.
//!
//! The base `files` table is the authoritative row source; `files_fts`
//! is an external-content FTS5 table over `(path, name, directory)`.
//! Incremental writes maintain the FTS index manually; bulk scans
//! rebuild it after commit.

use std::path::Path;

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id              INTEGER PRIMARY KEY,
    path            TEXT NOT NULL UNIQUE,
    path_normalized TEXT NOT NULL,
    name            TEXT NOT NULL,
    extension       TEXT NOT NULL DEFAULT '',
    directory       TEXT NOT NULL DEFAULT '',
    size            INTEGER NOT NULL DEFAULT 0,
    modified_at     INTEGER NOT NULL DEFAULT 0,
    indexed_at      INTEGER NOT NULL DEFAULT 0,
    is_binary       INTEGER NOT NULL DEFAULT 0,
    is_symlink      INTEGER NOT NULL DEFAULT 0,
    is_sensitive    INTEGER NOT NULL DEFAULT 0,
    git_tracked     INTEGER NOT NULL DEFAULT 0,
    git_ignored     INTEGER NOT NULL DEFAULT 0,
    content_hash    TEXT,
    line_count      INTEGER,
    file_id         INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_files_file_id ON files(file_id);
CREATE INDEX IF NOT EXISTS idx_files_path_normalized ON files(path_normalized);
CREATE INDEX IF NOT EXISTS idx_files_extension ON files(extension);
CREATE INDEX IF NOT EXISTS idx_files_directory ON files(directory);

CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
    path, name, directory,
    content='files', content_rowid='id'
);

CREATE TABLE IF NOT EXISTS directory_stats (
    path          TEXT PRIMARY KEY,
    file_count    INTEGER NOT NULL DEFAULT 0,
    total_size    INTEGER NOT NULL DEFAULT 0,
    last_modified INTEGER NOT NULL DEFAULT 0,
    indexed_at    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS index_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Open a connection with the pragmas every index connection uses:
/// WAL journaling, normal synchronisation, a large page cache and
/// memory-mapped reads.
pub fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA cache_size = -65536;
         PRAGMA mmap_size = 67108864;",
    )?;
    Ok(conn)
}

/// Idempotent schema initialisation.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT value FROM index_meta WHERE key = ?1",
        rusqlite::params![key],
        |row| row.get(0),
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_and_fts_is_available() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_connection(&dir.path().join("index.db")).unwrap();
        init_schema(&conn).unwrap();
        // Re-running is harmless.
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO files (path, path_normalized, name, directory) VALUES ('a/B.rs', 'a/b.rs', 'B.rs', 'a')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO files_fts (rowid, path, name, directory)
             SELECT id, path, name, directory FROM files",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM files_fts WHERE files_fts MATCH '\"B.rs\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_connection(&dir.path().join("index.db")).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_meta(&conn, "last_scan_at").unwrap(), None);
        set_meta(&conn, "last_scan_at", "2026-08-01T00:00:00Z").unwrap();
        assert_eq!(
            get_meta(&conn, "last_scan_at").unwrap().as_deref(),
            Some("2026-08-01T00:00:00Z")
        );
    }
}
