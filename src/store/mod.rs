//! Store bootstrap.
//!
//! Produces the [`ImageService`] every scan task shares: a connection to a
//! remote containerd when an address is configured, otherwise an embedded
//! service under the local root. The embedded snapshot driver is chosen here,
//! once, by trying overlay and falling back to native.
//!
//! ```text
//! <root>/
//! └── data/
//!     ├── content/       blob store
//!     ├── metadata.db    namespace table
//!     ├── overlay/       overlay driver root
//!     └── native/        native driver root (fallback)
//! ```

pub mod local;
pub mod metadata;
pub mod remote;

pub use local::LocalStore;
pub use metadata::MetadataDb;
pub use remote::RemoteStore;

use crate::constants::{CONTENT_DIR, DATA_DIR, METADATA_DB, NATIVE_DRIVER, OVERLAY_DRIVER};
use crate::error::{Error, Result};
use crate::service::ImageService;
use crate::snapshot::{self, NativeSnapshotter, OverlaySnapshotter, Snapshotter};
use crate::storage::BlobStore;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Where the image service lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// containerd socket address; empty selects the embedded store.
    pub address: String,
    /// Root directory for embedded store data.
    pub root: PathBuf,
    /// Content namespace.
    pub namespace: String,
}

/// An opened image service plus the snapshot driver it uses.
#[derive(Clone)]
pub struct Store {
    pub service: Arc<dyn ImageService>,
    /// Driver name; empty in remote mode.
    pub driver: String,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("driver", &self.driver).finish_non_exhaustive()
    }
}

/// Opens the image service described by `config`.
///
/// Any error here is fatal for the run. Failure of the overlay driver alone
/// is not an error: the native driver is used instead.
pub async fn open(config: &StoreConfig) -> Result<Store> {
    let service: Arc<dyn ImageService> = if config.address.is_empty() {
        Arc::new(open_embedded(&config.root, &config.namespace).await?)
    } else {
        Arc::new(RemoteStore::connect(&config.address, &config.namespace).await?)
    };

    service.ensure_namespace().await?;

    let driver = service.snapshotter().to_string();
    info!(driver = %driver, remote = !config.address.is_empty(), "image store ready");
    Ok(Store { service, driver })
}

/// Builds the embedded service rooted at `root`.
pub async fn open_embedded(root: &Path, namespace: &str) -> Result<LocalStore> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(root)
        .map_err(|e| Error::StorageInitFailed {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

    let data = root.join(DATA_DIR);
    let blobs = BlobStore::with_path(data.join(CONTENT_DIR))?;
    let metadata = MetadataDb::open(&data.join(METADATA_DB)).await?;

    let overlay_root = data.join(OVERLAY_DRIVER);
    let native_root = data.join(NATIVE_DRIVER);
    let driver = snapshot::select_driver(
        || Ok(Box::new(OverlaySnapshotter::new(&overlay_root)?) as Box<dyn Snapshotter>),
        || Ok(Box::new(NativeSnapshotter::new(&native_root)?) as Box<dyn Snapshotter>),
    )?;

    Ok(LocalStore::new(namespace, blobs, metadata, driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_embedded_layout() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("binscan");
        let config = StoreConfig {
            address: String::new(),
            root: root.clone(),
            namespace: "binscan".to_string(),
        };

        let store = open(&config).await.unwrap();
        assert!(store.driver == NATIVE_DRIVER || store.driver == OVERLAY_DRIVER);
        assert!(root.join("data/content").is_dir());
        assert!(root.join("data/metadata.db").is_file());
        assert!(root.join("data").join(&store.driver).join("snapshots").is_dir());

        // Reopening the same root (namespace already present) succeeds.
        open(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            address: dir.path().join("missing.sock").display().to_string(),
            root: dir.path().to_path_buf(),
            namespace: "binscan".to_string(),
        };
        assert!(open(&config).await.is_err());
    }
}
