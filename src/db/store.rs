//! Repository metadata store
//!
//! The store assigns repository ids (one per canonical endpoint) and records
//! the outcome of every archiving attempt. SQLite calls are synchronous, so
//! every operation runs on the blocking pool behind a shared connection.

use crate::error::{DbError, DbResult};
use crate::job::{canonical_endpoint, Job, RepositoryId};

use super::schema::{create_database, keys, set_info};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Archiving status of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryStatus {
    /// Known but never successfully archived
    Pending,
    /// Last attempt committed
    Processed,
    /// Last attempt failed
    Failed,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStatus::Pending => "pending",
            RepositoryStatus::Processed => "processed",
            RepositoryStatus::Failed => "failed",
        }
    }
}

impl FromStr for RepositoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RepositoryStatus::Pending),
            "processed" => Ok(RepositoryStatus::Processed),
            "failed" => Ok(RepositoryStatus::Failed),
            other => Err(format!("unknown repository status '{}'", other)),
        }
    }
}

/// A repository row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: RepositoryId,
    pub endpoint: String,
    pub provider: String,
    pub status: RepositoryStatus,
    /// Root the repository was last committed under
    pub root: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let text_err = |idx: usize, msg: String| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                msg.into(),
            )
        };

        let id: String = row.get(0)?;
        let status: String = row.get(3)?;
        let updated_at: String = row.get(6)?;

        Ok(Self {
            id: id.parse().map_err(|e: crate::error::JobError| text_err(0, e.to_string()))?,
            endpoint: row.get(1)?,
            provider: row.get(2)?,
            status: status.parse().map_err(|e| text_err(3, e))?,
            root: row.get(4)?,
            last_error: row.get(5)?,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| text_err(6, e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

/// Repository metadata sink
#[async_trait::async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Id for an endpoint, creating a pending record on first sight
    async fn find_or_create_by_endpoint(
        &self,
        endpoint: &str,
        provider: &str,
    ) -> DbResult<RepositoryId>;

    /// Look up a repository
    async fn get(&self, id: RepositoryId) -> DbResult<Option<RepositoryRecord>>;

    /// Record a committed archive
    async fn mark_processed(&self, job: &Job, root: &str) -> DbResult<()>;

    /// Record a failed attempt
    async fn mark_failed(&self, job: &Job, reason: &str) -> DbResult<()>;
}

/// SQLite-backed [`RepositoryStore`]
#[derive(Clone)]
pub struct SqliteRepositoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepositoryStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::CreateFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| DbError::CreateFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        create_database(&conn)?;
        set_info(&conn, keys::ARCHIVER_VERSION, env!("CARGO_PKG_VERSION"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| DbError::Task(e.to_string()))?
    }

    /// Number of repositories in each status
    pub async fn count_by_status(&self, status: RepositoryStatus) -> DbResult<u64> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM repositories WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    fn upsert_outcome(
        conn: &Connection,
        job: &Job,
        status: RepositoryStatus,
        root: Option<&str>,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        conn.execute(
            r#"
            INSERT INTO repositories (id, endpoint, provider, status, root, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                root = COALESCE(excluded.root, repositories.root),
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
            params![
                job.repository_id().to_string(),
                canonical_endpoint(&job.endpoint),
                job.provider,
                status.as_str(),
                root,
                last_error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RepositoryStore for SqliteRepositoryStore {
    async fn find_or_create_by_endpoint(
        &self,
        endpoint: &str,
        provider: &str,
    ) -> DbResult<RepositoryId> {
        let endpoint = canonical_endpoint(endpoint);
        let provider = provider.to_string();

        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM repositories WHERE endpoint = ?1",
                    [&endpoint],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                return id
                    .parse()
                    .map_err(|e: crate::error::JobError| DbError::Task(e.to_string()));
            }

            let id = RepositoryId::new();
            conn.execute(
                "INSERT INTO repositories (id, endpoint, provider, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    endpoint,
                    provider,
                    RepositoryStatus::Pending.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tracing::debug!(%id, %endpoint, "Registered repository");
            Ok(id)
        })
        .await
    }

    async fn get(&self, id: RepositoryId) -> DbResult<Option<RepositoryRecord>> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, endpoint, provider, status, root, last_error, updated_at
                     FROM repositories WHERE id = ?1",
                    [id.to_string()],
                    RepositoryRecord::from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn mark_processed(&self, job: &Job, root: &str) -> DbResult<()> {
        let job = job.clone();
        let root = root.to_string();
        self.with_conn(move |conn| {
            Self::upsert_outcome(conn, &job, RepositoryStatus::Processed, Some(&root), None)
        })
        .await
    }

    async fn mark_failed(&self, job: &Job, reason: &str) -> DbResult<()> {
        let job = job.clone();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            Self::upsert_outcome(conn, &job, RepositoryStatus::Failed, None, Some(&reason))
        })
        .await
    }
}
