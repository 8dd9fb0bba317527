//! Temporary clones
//!
//! A [`Fetcher`] pulls a repository into an empty directory and reports its
//! root. [`TemporaryCloner`] gives every fetch its own temporary directory,
//! removed when the [`FetchedRepository`] is dropped, whatever the outcome of
//! the job.

mod git;

pub use git::GitFetcher;

use crate::error::{CloneError, CloneResult};
use crate::job::Job;
use crate::storage::RootId;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Pulls repository content
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `endpoint` into the empty directory `dest` and return its root
    async fn fetch(&self, endpoint: &str, dest: &Path) -> CloneResult<RootId>;
}

/// A fetched repository in a private temporary directory
#[derive(Debug)]
pub struct FetchedRepository {
    dir: TempDir,
    root: RootId,
}

impl FetchedRepository {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Root the repository belongs to
    pub fn root(&self) -> &RootId {
        &self.root
    }
}

/// Fetches jobs' repositories into temporary directories
#[derive(Clone)]
pub struct TemporaryCloner {
    fetcher: Arc<dyn Fetcher>,
    temp_dir: PathBuf,
}

impl TemporaryCloner {
    pub fn new(fetcher: Arc<dyn Fetcher>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            temp_dir: temp_dir.into(),
        }
    }

    pub async fn clone_job(&self, job: &Job) -> CloneResult<FetchedRepository> {
        let temp_dir = self.temp_dir.clone();
        let dir = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&temp_dir)?;
            tempfile::Builder::new()
                .prefix("clone-")
                .tempdir_in(&temp_dir)
        })
        .await
        .map_err(std::io::Error::other)??;

        let root = self.fetcher.fetch(&job.endpoint, dir.path()).await?;
        tracing::debug!(repository = %job.repository_id(), %root, "Fetched repository");

        Ok(FetchedRepository { dir, root })
    }
}

impl std::fmt::Debug for TemporaryCloner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryCloner")
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

/// Lexicographically smallest of the given root commit hashes
pub(crate) fn pick_root(endpoint: &str, roots: &str) -> CloneResult<RootId> {
    roots
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .min()
        .ok_or_else(|| CloneError::EmptyRepository {
            endpoint: endpoint.to_string(),
        })?
        .parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RepositoryId;

    struct StaticFetcher;

    #[async_trait::async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, endpoint: &str, dest: &Path) -> CloneResult<RootId> {
            tokio::fs::write(dest.join("HEAD"), endpoint).await?;
            "abcdef01".parse()
        }
    }

    #[tokio::test]
    async fn test_clone_into_private_dir() {
        let temp = tempfile::tempdir().unwrap();
        let cloner = TemporaryCloner::new(Arc::new(StaticFetcher), temp.path().join("clones"));
        let job = Job::new(RepositoryId::new(), "https://example.com/r", "test");

        let a = cloner.clone_job(&job).await.unwrap();
        let b = cloner.clone_job(&job).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(a.root().as_str(), "abcdef01");
        assert_eq!(
            std::fs::read_to_string(a.path().join("HEAD")).unwrap(),
            "https://example.com/r"
        );

        let path = a.path().to_path_buf();
        drop(a);
        assert!(!path.exists());
    }

    #[test]
    fn test_pick_root() {
        let roots = "ffff0000\n0000aaaa\n\n";
        assert_eq!(pick_root("e", roots).unwrap().as_str(), "0000aaaa");
        assert!(matches!(
            pick_root("e", "\n"),
            Err(CloneError::EmptyRepository { .. })
        ));
        assert!(matches!(
            pick_root("e", "not-a-hash"),
            Err(CloneError::InvalidRoot(_))
        ));
    }
}
