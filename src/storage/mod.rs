//! Rooted storage
//!
//! Durable, versioned archives of rooted repositories on a local directory
//! or an object store, replaced only through [`Transaction::commit`].
//!
//! # Layout
//!
//! ```text
//! <storage root>/
//!   ab/                       (bucket, when bucket size = 2)
//!     abcdef....zip           (one archive per root)
//!       <repository id>/      (one bare mirror per repository sharing the root)
//! ```

pub mod archive;
pub mod fs;
pub mod location;
pub mod object_fs;
pub mod transactioner;

pub use fs::{Chroot, Fs, LocalFs};
pub use location::{RootId, StorageLocation};
pub use object_fs::ObjectStoreFs;
pub use transactioner::{RootedTransactioner, Transaction};

use crate::error::{StorageError, StorageResult};
use std::path::PathBuf;
use std::sync::Arc;

/// Open the storage backend named by `location`.
///
/// A plain path or a `file://` URL selects [`LocalFs`]; any other URL is
/// handed to the object store registry.
pub fn open(location: &str) -> StorageResult<Arc<dyn Fs>> {
    let invalid = |reason: String| StorageError::InvalidLocation {
        location: location.to_string(),
        reason,
    };

    if location.trim().is_empty() {
        return Err(invalid("empty storage location".into()));
    }

    if !location.contains("://") {
        return Ok(Arc::new(LocalFs::new(PathBuf::from(location))));
    }

    let url = url::Url::parse(location).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| invalid("not a local file URL".into()))?;
        return Ok(Arc::new(LocalFs::new(path)));
    }

    // Keep the object store unscoped and confine it with a chroot so every
    // backend resolves paths the same way.
    let mut base = url.clone();
    base.set_path("/");
    let prefix = url.path().trim_matches('/').to_string();
    let store: Arc<dyn Fs> = Arc::new(ObjectStoreFs::from_url(&base)?);
    Ok(Arc::new(Chroot::new(store, &prefix)?))
}
