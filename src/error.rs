//! Error types for repo-archiver
//!
//! One enum per concern, aggregated into [`ArchiverError`]:
//! - Queue transport errors (publish/consume/ack)
//! - Job source and job encoding errors
//! - Distributed lock errors
//! - Rooted storage and transaction errors
//! - Clone/fetch errors
//! - Metadata database errors
//! - Configuration errors
//!
//! Per-job errors never escape the worker boundary; they are reported through
//! notifiers and the metadata sink. Only configuration and startup errors are
//! fatal.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for repo-archiver
#[derive(Error, Debug)]
pub enum ArchiverError {
    /// Queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Job source errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Job encoding errors
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Clone errors
    #[error("Clone error: {0}")]
    Clone(#[from] CloneError),

    /// Metadata database errors
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A unit of work ran past its deadline
    #[error("Job exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// A unit of work was aborted by a forced shutdown
    #[error("Job aborted by forced shutdown")]
    Aborted,

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl ArchiverError {
    /// Whether the job that produced this error may be requeued.
    ///
    /// Malformed payloads and repositories that can never be archived are
    /// not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiverError::Job(_) => false,
            ArchiverError::Clone(e) => e.is_retryable(),
            ArchiverError::Config(_) => false,
            _ => true,
        }
    }

    /// Whether this error is lock contention rather than a job failure
    pub fn is_contention(&self) -> bool {
        matches!(self, ArchiverError::Lock(e) if e.is_contention())
    }
}

/// Queue transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection to the broker failed
    #[error("Failed to connect to queue at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Broker operation failed
    #[error("Queue operation failed: {0}")]
    OperationFailed(String),

    /// Delivery is not (or no longer) leased by this consumer
    #[error("Unknown delivery '{0}'")]
    UnknownDelivery(String),

    /// Queue has been closed
    #[error("Queue '{0}' is closed")]
    Closed(String),

    /// Envelope could not be encoded or decoded
    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(String),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Redis(err.to_string())
    }
}

/// Job source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source is permanently exhausted
    #[error("Job source is closed")]
    Closed,

    /// A mention could not be decoded
    #[error("Invalid mention: {0}")]
    InvalidMention(String),

    /// The upstream queue failed
    #[error("Upstream queue failed: {0}")]
    Queue(#[from] QueueError),

    /// Repository lookup failed
    #[error("Repository lookup failed: {0}")]
    Lookup(#[from] DbError),

    /// Reading the source failed
    #[error("Failed to read source: {0}")]
    Io(#[from] std::io::Error),
}

/// Job encoding errors
#[derive(Error, Debug)]
pub enum JobError {
    /// Payload could not be encoded
    #[error("Failed to encode job: {0}")]
    Encode(String),

    /// Payload could not be decoded
    #[error("Failed to decode job: {0}")]
    Decode(String),

    /// Invalid repository identifier
    #[error("Invalid repository id '{0}'")]
    InvalidRepositoryId(String),
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// The key is held by someone else
    #[error("Lock '{key}' is already held")]
    Held { key: String },

    /// The handle no longer owns the key (expired or stolen)
    #[error("Lock '{key}' is no longer owned by this handle")]
    Lost { key: String },

    /// Invalid locking service configuration
    #[error("Invalid locking configuration '{config}': {reason}")]
    InvalidConfig { config: String, reason: String },

    /// Lock backend is unavailable
    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),
}

impl LockError {
    /// Whether the caller should simply try later
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Held { .. })
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Unavailable(err.to_string())
    }
}

/// Rooted storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Local filesystem error
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Object store error
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Invalid storage location
    #[error("Invalid storage location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    /// Archive container error
    #[error("Archive error: {0}")]
    Archive(String),

    /// Commit did not complete; durable version is unchanged
    #[error("Commit of root '{root}' failed: {reason}")]
    CommitFailed { root: String, reason: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<zip::result::ZipError> for StorageError {
    fn from(err: zip::result::ZipError) -> Self {
        StorageError::Archive(err.to_string())
    }
}

/// Clone/fetch errors
#[derive(Error, Debug)]
pub enum CloneError {
    /// Fetch command failed
    #[error("Fetch of '{endpoint}' failed: {stderr}")]
    FetchFailed { endpoint: String, stderr: String },

    /// Repository has no commits, so no root can be determined
    #[error("Repository '{endpoint}' is empty")]
    EmptyRepository { endpoint: String },

    /// Invalid root hash produced by the fetcher
    #[error("Invalid root hash '{0}'")]
    InvalidRoot(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloneError {
    /// Whether fetching again could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CloneError::EmptyRepository { .. } | CloneError::InvalidRoot(_)
        )
    }
}

/// Metadata database errors
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to create database file
    #[error("Failed to create database at '{path}': {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    /// Blocking task failed
    #[error("Database task failed: {0}")]
    Task(String),

    /// Database written by an incompatible version
    #[error("Unsupported schema version {found} (expected {expected})")]
    SchemaMismatch { found: String, expected: u32 },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid duration string
    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    /// Invalid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Out-of-range or malformed option
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    /// Invalid path
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ArchiverError>;

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type for clone operations
pub type CloneResult<T> = std::result::Result<T, CloneError>;

/// Result type for database operations
pub type DbResult<T> = std::result::Result<T, DbError>;
