//! Filesystem capability
//!
//! Rooted storage only ever needs whole-file reads and writes plus an atomic
//! rename. Both backends expose exactly that through [`Fs`]; paths are
//! relative, `/`-separated and confined to the backend's root.

use crate::error::{StorageError, StorageResult};

use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Path-oriented storage backend
#[async_trait::async_trait]
pub trait Fs: Send + Sync + fmt::Debug {
    /// Whole contents of `path`, or `None` if it does not exist
    async fn read(&self, path: &str) -> StorageResult<Option<Bytes>>;

    /// Create or overwrite `path` durably, creating parent directories
    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()>;

    /// Move `from` over `to`, replacing it atomically
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Remove `path`; a missing path is not an error
    async fn remove(&self, path: &str) -> StorageResult<()>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Check that the backend is reachable
    async fn probe(&self) -> StorageResult<()>;
}

/// Reject absolute paths and parent components
pub(crate) fn check_relative(path: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidLocation {
        location: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') {
        return Err(invalid("path must be relative"));
    }
    if path.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(invalid("path must not contain '..' or empty components"));
    }
    Ok(())
}

/// Local directory backend
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        check_relative(path)?;
        Ok(self.root.join(path))
    }

    fn io_err(path: &Path, e: io::Error) -> StorageError {
        StorageError::io(path.display().to_string(), e)
    }

    /// Make a directory entry change durable
    async fn fsync_dir(dir: &Path) -> StorageResult<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .open(&dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| Self::io_err(&dir, e))
        })
        .await
        .map_err(|e| StorageError::io("fsync", io::Error::new(io::ErrorKind::Other, e)))?
    }
}

#[async_trait::async_trait]
impl Fs for LocalFs {
    async fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(&full, e)),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        use tokio::io::AsyncWriteExt;

        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(parent, e))?;
        }

        let mut file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| Self::io_err(&full, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| Self::io_err(&full, e))?;
        file.sync_all().await.map_err(|e| Self::io_err(&full, e))?;

        if let Some(parent) = full.parent() {
            Self::fsync_dir(parent).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(parent, e))?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| Self::io_err(&src, e))?;

        if let Some(parent) = dst.parent() {
            Self::fsync_dir(parent).await?;
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&full, e)),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| Self::io_err(&full, e))
    }

    async fn probe(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io_err(&self.root, e))?;
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| Self::io_err(&self.root, e))?;
        if !meta.is_dir() {
            return Err(StorageError::InvalidLocation {
                location: self.root.display().to_string(),
                reason: "not a directory".into(),
            });
        }
        Ok(())
    }
}

/// Confines another backend to a subdirectory
#[derive(Debug, Clone)]
pub struct Chroot {
    inner: Arc<dyn Fs>,
    base: String,
}

impl Chroot {
    /// Scope `inner` to `base`; an empty base is the identity
    pub fn new(inner: Arc<dyn Fs>, base: &str) -> StorageResult<Self> {
        let base = base.trim_matches('/').to_string();
        if !base.is_empty() {
            check_relative(&base)?;
        }
        Ok(Self { inner, base })
    }

    fn join(&self, path: &str) -> StorageResult<String> {
        check_relative(path)?;
        if self.base.is_empty() {
            Ok(path.to_string())
        } else {
            Ok(format!("{}/{}", self.base, path))
        }
    }
}

#[async_trait::async_trait]
impl Fs for Chroot {
    async fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
        self.inner.read(&self.join(path)?).await
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        self.inner.write(&self.join(path)?, data).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.rename(&self.join(from)?, &self.join(to)?).await
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        self.inner.remove(&self.join(path)?).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.exists(&self.join(path)?).await
    }

    async fn probe(&self) -> StorageResult<()> {
        self.inner.probe().await
    }
}
