//! Job types and their wire encoding

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::JobError;

/// Opaque repository identifier
///
/// Assigned once per canonical endpoint by the metadata store and never
/// mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(Uuid);

impl RepositoryId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil identifier
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Borrow the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RepositoryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RepositoryId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| JobError::InvalidRepositoryId(s.to_string()))
    }
}

/// Version control system of a mentioned repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    #[default]
    Git,
}

/// A sighting of a repository endpoint in the upstream feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    /// Clone URL of the repository
    pub endpoint: String,
    /// Where the mention came from (e.g. "github")
    pub provider: String,
    /// Version control system
    #[serde(default)]
    pub vcs: Vcs,
}

impl Mention {
    /// Create a git mention
    pub fn new(endpoint: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            provider: provider.into(),
            vcs: Vcs::Git,
        }
    }

    /// Encode for publishing on a mentions queue
    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self).map_err(|e| JobError::Encode(e.to_string()))
    }

    /// Decode a mentions queue payload
    pub fn decode(payload: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(payload).map_err(|e| JobError::Decode(e.to_string()))
    }
}

/// Normalize an endpoint so that equivalent spellings map to one repository
pub fn canonical_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            if path.is_empty() {
                format!("{}://{}", scheme.to_lowercase(), host.to_lowercase())
            } else {
                format!("{}://{}/{}", scheme.to_lowercase(), host.to_lowercase(), path)
            }
        }
        None => trimmed.to_string(),
    }
}

/// A repository to archive
///
/// Equality is by `repository_id` only: two jobs for the same repository
/// are the same job, whatever metadata they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Repository identity, immutable once published
    repository_id: RepositoryId,
    /// Clone URL
    pub endpoint: String,
    /// Provider the repository was discovered on
    pub provider: String,
    /// When the job was produced
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job
    pub fn new(
        repository_id: RepositoryId,
        endpoint: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            repository_id,
            endpoint: endpoint.into(),
            provider: provider.into(),
            created_at: Utc::now(),
        }
    }

    /// Repository this job archives
    pub fn repository_id(&self) -> RepositoryId {
        self.repository_id
    }

    /// Name of the lock that guards this job's repository
    pub fn lock_key(&self) -> String {
        format!("repo:{}", self.repository_id)
    }

    /// Encode for the queue
    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self).map_err(|e| JobError::Encode(e.to_string()))
    }

    /// Decode a queue payload
    pub fn decode(payload: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(payload).map_err(|e| JobError::Decode(e.to_string()))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.repository_id == other.repository_id
    }
}

impl Eq for Job {}
