//! Transactional commits of rooted repositories
//!
//! `begin` checks the durable archive of a root out into a private
//! workspace, the caller mutates the workspace, and `commit` packs it and
//! swaps it in with write-to-staging-then-rename. Until that rename the
//! durable archive is untouched; a failed or abandoned transaction only
//! loses its workspace.
//!
//! Concurrent transactions on the same root are not serialized here; callers
//! hold the root's lock.

use super::archive::{pack_dir, unpack_to_dir};
use super::fs::Fs;
use super::location::{RootId, StorageLocation};
use crate::error::{StorageError, StorageResult};

use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Opens transactions against one storage backend
#[derive(Debug, Clone)]
pub struct RootedTransactioner {
    fs: Arc<dyn Fs>,
    temp_dir: PathBuf,
    bucket_size: usize,
}

impl RootedTransactioner {
    /// `temp_dir` holds the workspaces; `bucket_size` 0 means a flat layout
    pub fn new(fs: Arc<dyn Fs>, temp_dir: impl Into<PathBuf>, bucket_size: usize) -> Self {
        Self {
            fs,
            temp_dir: temp_dir.into(),
            bucket_size,
        }
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Location of a root's durable archive
    pub fn location(&self, root: &RootId) -> StorageResult<StorageLocation> {
        StorageLocation::resolve(root, self.bucket_size)
    }

    /// Check out the current durable version of `root` (or nothing, for a
    /// new root) into a fresh workspace
    pub async fn begin(&self, root: RootId) -> StorageResult<Transaction> {
        let location = self.location(&root)?;

        let temp_dir = self.temp_dir.clone();
        let workspace = blocking(move || {
            let err = |e| StorageError::io(temp_dir.display().to_string(), e);
            fs::create_dir_all(&temp_dir).map_err(err)?;
            tempfile::Builder::new()
                .prefix("tx-")
                .tempdir_in(&temp_dir)
                .map_err(err)
        })
        .await?;

        if let Some(data) = self.fs.read(location.path()).await? {
            let dest = workspace.path().to_path_buf();
            blocking(move || unpack_to_dir(&data, &dest)).await?;
            tracing::debug!(%root, %location, "Checked out existing root");
        } else {
            tracing::debug!(%root, %location, "Starting new root");
        }

        Ok(Transaction {
            fs: self.fs.clone(),
            root,
            location,
            workspace,
        })
    }
}

/// One open transaction; dropping it rolls back
#[derive(Debug)]
pub struct Transaction {
    fs: Arc<dyn Fs>,
    root: RootId,
    location: StorageLocation,
    workspace: TempDir,
}

impl Transaction {
    pub fn root(&self) -> &RootId {
        &self.root
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Private working copy; nothing here is visible until commit
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Replace `<workspace>/<subdir>` with a copy of the tree at `src`
    pub async fn apply_from(&self, src: &Path, subdir: &str) -> StorageResult<()> {
        super::fs::check_relative(subdir)?;

        let src = src.to_path_buf();
        let dest = self.workspace.path().join(subdir);
        blocking(move || {
            match fs::remove_dir_all(&dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(dest.display().to_string(), e)),
            }
            copy_tree(&src, &dest)
        })
        .await
    }

    /// Atomically replace the durable version with the workspace contents.
    ///
    /// On error the durable version is unchanged and the staging object is
    /// cleaned up. The same holds if the returned future is dropped, except
    /// that the cleanup finishes in the background.
    pub async fn commit(self) -> StorageResult<()> {
        let workspace = self.workspace.path().to_path_buf();
        let data = blocking(move || pack_dir(&workspace)).await?;
        let size = data.len();

        let staging = self.location.staging_path(&Uuid::new_v4().simple().to_string());
        let mut guard = StagingGuard {
            fs: self.fs.clone(),
            path: Some(staging.clone()),
        };
        let result = async {
            self.fs.write(&staging, Bytes::from(data)).await?;
            self.fs.rename(&staging, self.location.path()).await
        }
        .await;
        guard.disarm();

        if let Err(e) = result {
            if let Err(cleanup) = self.fs.remove(&staging).await {
                tracing::warn!(%staging, "Failed to remove staging object: {}", cleanup);
            }
            return Err(StorageError::CommitFailed {
                root: self.root.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::debug!(root = %self.root, location = %self.location, bytes = size, "Committed root");
        Ok(())
    }

    /// Discard the workspace
    pub fn rollback(self) -> StorageResult<()> {
        let path = self.workspace.path().display().to_string();
        self.workspace
            .close()
            .map_err(|e| StorageError::io(path, e))
    }
}

/// Removes a staging object left behind by a commit that never finished
struct StagingGuard {
    fs: Arc<dyn Fs>,
    path: Option<String>,
}

impl StagingGuard {
    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        // Commit future dropped mid-write; clean up in the background
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let fs = self.fs.clone();
            runtime.spawn(async move {
                if let Err(e) = fs.remove(&path).await {
                    tracing::warn!(staging = %path, "Failed to remove staging object: {}", e);
                }
            });
        }
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Archive(format!("blocking task failed: {}", e)))?
}

/// Recursively copy regular files and directories from `src` into `dest`
fn copy_tree(src: &Path, dest: &Path) -> StorageResult<()> {
    let err = |path: &Path| {
        let path = path.display().to_string();
        move |e: io::Error| StorageError::io(path, e)
    };

    fs::create_dir_all(dest).map_err(err(dest))?;
    for entry in fs::read_dir(src).map_err(err(src))? {
        let entry = entry.map_err(err(src))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type().map_err(err(&from))?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to).map_err(err(&from))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::LocalFs;
    use crate::storage::ObjectStoreFs;
    use async_trait::async_trait;
    use object_store::memory::InMemory;

    fn root() -> RootId {
        "abcdef0123456789".parse().unwrap()
    }

    /// LocalFs whose renames always fail
    #[derive(Debug)]
    struct FailingRename(LocalFs);

    #[async_trait]
    impl Fs for FailingRename {
        async fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
            self.0.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
            self.0.write(path, data).await
        }
        async fn rename(&self, from: &str, _to: &str) -> StorageResult<()> {
            Err(StorageError::io(
                from,
                io::Error::new(io::ErrorKind::Other, "backend unavailable"),
            ))
        }
        async fn remove(&self, path: &str) -> StorageResult<()> {
            self.0.remove(path).await
        }
        async fn exists(&self, path: &str) -> StorageResult<bool> {
            self.0.exists(path).await
        }
        async fn probe(&self) -> StorageResult<()> {
            self.0.probe().await
        }
    }

    /// LocalFs that stalls once a staging write has landed
    #[derive(Debug)]
    struct StallAfterWrite(LocalFs);

    #[async_trait]
    impl Fs for StallAfterWrite {
        async fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
            self.0.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
            self.0.write(path, data).await?;
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(())
        }
        async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
            self.0.rename(from, to).await
        }
        async fn remove(&self, path: &str) -> StorageResult<()> {
            self.0.remove(path).await
        }
        async fn exists(&self, path: &str) -> StorageResult<bool> {
            self.0.exists(path).await
        }
        async fn probe(&self) -> StorageResult<()> {
            self.0.probe().await
        }
    }

    fn source_tree(contents: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("refs")).unwrap();
        fs::write(dir.path().join("HEAD"), contents).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_commit_visible_to_next_begin() {
        let storage = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tx = RootedTransactioner::new(Arc::new(LocalFs::new(storage.path())), temp.path(), 2);

        let t1 = tx.begin(root()).await.unwrap();
        assert_eq!(fs::read_dir(t1.workspace()).unwrap().count(), 0);
        let src = source_tree("v1");
        t1.apply_from(src.path(), "repo-a").await.unwrap();
        t1.commit().await.unwrap();

        assert!(storage.path().join("ab/abcdef0123456789.zip").exists());

        let t2 = tx.begin(root()).await.unwrap();
        assert_eq!(
            fs::read_to_string(t2.workspace().join("repo-a/HEAD")).unwrap(),
            "v1"
        );

        // A second repository under the same root is added alongside
        let other = source_tree("other");
        t2.apply_from(other.path(), "repo-b").await.unwrap();
        t2.commit().await.unwrap();

        let t3 = tx.begin(root()).await.unwrap();
        assert!(t3.workspace().join("repo-a/HEAD").exists());
        assert!(t3.workspace().join("repo-b/HEAD").exists());
        t3.rollback().unwrap();

        // No staging leftovers
        let names: Vec<_> = fs::read_dir(storage.path().join("ab"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_replaces_subdir() {
        let storage = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tx = RootedTransactioner::new(Arc::new(LocalFs::new(storage.path())), temp.path(), 0);

        let t = tx.begin(root()).await.unwrap();
        let first = source_tree("v1");
        fs::write(first.path().join("refs/stale"), "x").unwrap();
        t.apply_from(first.path(), "repo").await.unwrap();

        let second = source_tree("v2");
        t.apply_from(second.path(), "repo").await.unwrap();
        assert_eq!(fs::read_to_string(t.workspace().join("repo/HEAD")).unwrap(), "v2");
        assert!(!t.workspace().join("repo/refs/stale").exists());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_durable_bytes_identical() {
        let storage = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();

        // Establish a durable version
        let good = RootedTransactioner::new(Arc::new(LocalFs::new(storage.path())), temp.path(), 2);
        let t = good.begin(root()).await.unwrap();
        t.apply_from(source_tree("v1").path(), "repo").await.unwrap();
        t.commit().await.unwrap();

        let durable = storage.path().join("ab/abcdef0123456789.zip");
        let before = fs::read(&durable).unwrap();

        // Mutate and fail the commit
        let failing = RootedTransactioner::new(
            Arc::new(FailingRename(LocalFs::new(storage.path()))),
            temp.path(),
            2,
        );
        let t = failing.begin(root()).await.unwrap();
        t.apply_from(source_tree("v2").path(), "repo").await.unwrap();
        let err = t.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::CommitFailed { .. }));

        assert_eq!(fs::read(&durable).unwrap(), before);
        let entries = fs::read_dir(storage.path().join("ab")).unwrap().count();
        assert_eq!(entries, 1, "staging object must be cleaned up");

        // Read-back through a fresh transaction still sees v1
        let t = good.begin(root()).await.unwrap();
        assert_eq!(fs::read_to_string(t.workspace().join("repo/HEAD")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_abandoned_commit_removes_staging_object() {
        let storage = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tx = RootedTransactioner::new(
            Arc::new(StallAfterWrite(LocalFs::new(storage.path()))),
            temp.path(),
            2,
        );
        let bucket = storage.path().join("ab");

        for _ in 0..3 {
            let t = tx.begin(root()).await.unwrap();
            t.apply_from(source_tree("v1").path(), "repo").await.unwrap();
            let commit = tokio::time::timeout(std::time::Duration::from_millis(100), t.commit());
            assert!(commit.await.is_err());
        }

        // Removal runs on a spawned task
        let mut leftovers = usize::MAX;
        for _ in 0..100 {
            leftovers = fs::read_dir(&bucket).unwrap().count();
            if leftovers == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(leftovers, 0);
        assert!(!bucket.join("abcdef0123456789.zip").exists());
    }

    #[tokio::test]
    async fn test_dropped_transaction_removes_workspace() {
        let storage = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tx = RootedTransactioner::new(Arc::new(LocalFs::new(storage.path())), temp.path(), 0);

        let t = tx.begin(root()).await.unwrap();
        let workspace = t.workspace().to_path_buf();
        assert!(workspace.exists());
        drop(t);

        assert!(!workspace.exists());
        assert!(!storage.path().join("abcdef0123456789.zip").exists());
    }

    #[tokio::test]
    async fn test_object_store_backend() {
        let fs: Arc<dyn Fs> = Arc::new(ObjectStoreFs::new(
            Arc::new(InMemory::new()),
            object_store::path::Path::from("roots"),
            "memory:///roots",
        ));
        let temp = tempfile::tempdir().unwrap();
        let tx = RootedTransactioner::new(fs.clone(), temp.path(), 3);

        let t = tx.begin(root()).await.unwrap();
        t.apply_from(source_tree("remote").path(), "repo").await.unwrap();
        t.commit().await.unwrap();

        assert!(fs.exists("abc/abcdef0123456789.zip").await.unwrap());
        let t = tx.begin(root()).await.unwrap();
        assert_eq!(
            fs::read_to_string(t.workspace().join("repo/HEAD")).unwrap(),
            "remote"
        );
    }
}
