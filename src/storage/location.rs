//! Placement of rooted repositories
//!
//! A root lives at `<root>.zip`, or at `<prefix>/<root>.zip` when a bucket
//! size is configured, where `<prefix>` is the first `bucket_size`
//! characters of the root hash.

use crate::error::{CloneError, StorageError, StorageResult};
use std::fmt;
use std::str::FromStr;

/// File extension of a rooted repository archive
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Content hash identifying a rooted repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(String);

impl RootId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RootId {
    type Err = CloneError;

    /// Lowercase hex, 4 to 64 characters
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = (4..=64).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(CloneError::InvalidRoot(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a root's durable version lives inside the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    path: String,
}

impl StorageLocation {
    /// Resolve the location of `root` for the given bucket size
    pub fn resolve(root: &RootId, bucket_size: usize) -> StorageResult<Self> {
        let hash = root.as_str();
        if bucket_size > hash.len() {
            return Err(StorageError::InvalidLocation {
                location: hash.to_string(),
                reason: format!(
                    "bucket size {} exceeds root hash length {}",
                    bucket_size,
                    hash.len()
                ),
            });
        }

        let file = format!("{}.{}", hash, ARCHIVE_EXTENSION);
        let path = if bucket_size == 0 {
            file
        } else {
            format!("{}/{}", &hash[..bucket_size], file)
        };
        Ok(Self { path })
    }

    /// Path relative to the storage root
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Unique sibling used to stage a commit
    pub fn staging_path(&self, tag: &str) -> String {
        format!("{}.tmp-{}", self.path, tag)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
