//! Object store backend
//!
//! Any store `object_store::parse_url` understands (`file://`, `memory://`,
//! and the cloud schemes when their features are enabled). Renames use the
//! store's own copy-then-delete or native rename; a reader sees either the
//! old object or the new one.

use super::fs::{check_relative, Fs};
use crate::error::{StorageError, StorageResult};

use bytes::Bytes;
use object_store::{path::Path, ObjectStore, PutPayload};
use std::fmt;
use std::sync::Arc;

/// [`Fs`] over an object store
#[derive(Clone)]
pub struct ObjectStoreFs {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    url: String,
}

impl ObjectStoreFs {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path, url: impl Into<String>) -> Self {
        Self {
            store,
            prefix,
            url: url.into(),
        }
    }

    /// Open the store named by a URL; the URL path becomes the key prefix
    pub fn from_url(url: &url::Url) -> StorageResult<Self> {
        let (store, prefix) = object_store::parse_url(url)?;
        Ok(Self::new(Arc::from(store), prefix, url.as_str()))
    }

    fn resolve(&self, path: &str) -> StorageResult<Path> {
        check_relative(path)?;
        Ok(path
            .split('/')
            .fold(self.prefix.clone(), |acc, part| acc.child(part)))
    }
}

impl fmt::Debug for ObjectStoreFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreFs")
            .field("url", &self.url)
            .field("prefix", &self.prefix.as_ref())
            .finish()
    }
}

#[async_trait::async_trait]
impl Fs for ObjectStoreFs {
    async fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
        let location = self.resolve(path)?;
        match self.store.get(&location).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let location = self.resolve(path)?;
        self.store.put(&location, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.store.rename(&src, &dst).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        let location = self.resolve(path)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let location = self.resolve(path)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self) -> StorageResult<()> {
        self.store
            .list_with_delimiter(Some(&self.prefix))
            .await
            .map_err(|e| StorageError::InvalidLocation {
                location: self.url.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
