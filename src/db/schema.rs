//! Database schema definitions and creation
//!
//! One row per repository, keyed by its canonical endpoint, plus a small
//! key/value table for store metadata.

use crate::error::{DbError, DbResult};
use rusqlite::Connection;

/// Current schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the repositories table
const CREATE_REPOSITORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,             -- UUID
    endpoint TEXT NOT NULL UNIQUE,   -- canonical clone URL
    provider TEXT NOT NULL,
    status TEXT NOT NULL,            -- pending | processed | failed
    root TEXT,                       -- last committed root hash
    last_error TEXT,
    updated_at TEXT NOT NULL         -- RFC 3339
)
"#;

/// SQL to create store metadata table
const CREATE_ARCHIVER_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS archiver_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

const CREATE_INDEXES: &[&str] =
    &["CREATE INDEX IF NOT EXISTS idx_repositories_status ON repositories(status)"];

/// Several processes may share one database file
const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#;

/// Create and configure the database
pub fn create_database(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(PRAGMAS)?;

    conn.execute(CREATE_REPOSITORIES_TABLE, [])?;
    conn.execute(CREATE_ARCHIVER_INFO_TABLE, [])?;
    for sql in CREATE_INDEXES {
        conn.execute(sql, [])?;
    }

    let expected = SCHEMA_VERSION.to_string();
    match get_info(conn, keys::SCHEMA_VERSION)? {
        Some(found) if found != expected => Err(DbError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        }),
        Some(_) => Ok(()),
        None => set_info(conn, keys::SCHEMA_VERSION, &expected),
    }
}

/// Store metadata
pub fn set_info(conn: &Connection, key: &str, value: &str) -> DbResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO archiver_info (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get metadata
pub fn get_info(conn: &Connection, key: &str) -> DbResult<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM archiver_info WHERE key = ?1",
        [key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Metadata keys
pub mod keys {
    /// Schema version
    pub const SCHEMA_VERSION: &str = "schema_version";

    /// Crate version that created the database
    pub const ARCHIVER_VERSION: &str = "archiver_version";
}
