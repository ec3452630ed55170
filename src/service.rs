//! The Image & Snapshot Service seam.
//!
//! Everything the acquisition pipeline needs from image storage goes through
//! [`ImageService`]: pulling (with unpack), view snapshots keyed by the
//! caller, and mounting. The embedded store and a remote containerd both
//! implement it, and tests substitute an in-memory fake.

use crate::error::Result;
use crate::identity::ChainId;
use crate::mount::{self, Mount};
use crate::registry::PullOptions;
use async_trait::async_trait;
use std::path::Path;

/// An image that has been pulled and unpacked for the active snapshotter.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Reference the image was pulled by.
    pub reference: String,
    /// Manifest digest.
    pub digest: String,
    /// Uncompressed layer digests, bottom-to-top.
    pub diff_ids: Vec<String>,
}

impl ImageHandle {
    /// Computes the chain ID of the fully unpacked image.
    pub fn chain_id(&self) -> Result<ChainId> {
        ChainId::from_diff_ids(&self.diff_ids)
    }
}

/// Image & Snapshot Service contract.
///
/// Implementations must be safe to call concurrently from many scan tasks.
/// Snapshot keys are owned by exactly one task at a time.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Name of the snapshot driver in use (empty when the remote side picks).
    fn snapshotter(&self) -> &str;

    /// Creates the content namespace. An existing namespace is not an error.
    async fn ensure_namespace(&self) -> Result<()>;

    /// Pulls `reference` and unpacks it for the active snapshotter.
    async fn pull(&self, reference: &str, opts: &PullOptions) -> Result<ImageHandle>;

    /// Creates a read-only view snapshot `key` of the chain `parent`.
    ///
    /// Returns `Error::SnapshotAlreadyExists` if `key` is in use.
    async fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>>;

    /// Returns the mounts of an existing snapshot.
    async fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Removes snapshot `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Applies `mounts` onto `target`.
    async fn mount(&self, mounts: &[Mount], target: &Path) -> Result<()> {
        let mounts = mounts.to_vec();
        let target = target.to_path_buf();
        run_blocking(move || mount::mount_all(&mounts, &target)).await
    }

    /// Unmounts everything at `target`.
    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.to_path_buf();
        run_blocking(move || mount::unmount_all(&target)).await
    }
}

/// Runs blocking filesystem work off the async worker threads.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| crate::error::Error::Internal(format!("blocking task failed: {}", e)))?
}
