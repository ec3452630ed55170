//! Snapshot drivers for the embedded image service.
//!
//! A driver materializes unpacked layer chains as *committed* snapshots
//! keyed by [`ChainId`], and hands out read-only *views* of them under
//! caller-chosen keys. Two drivers exist:
//!
//! | Driver | Committed snapshot | View |
//! |--------|--------------------|------|
//! | [`OverlaySnapshotter`] | one directory per layer | `overlay` with `lowerdir` = chain |
//! | [`NativeSnapshotter`]  | full copy of parent + layer | read-only bind mount |
//!
//! ## On-disk layout
//!
//! ```text
//! <driver root>/
//! ├── snapshots/<chain hex>/
//! │   ├── fs/        (layer or full tree)
//! │   ├── parent     (parent chain ID, absent for the base layer)
//! │   └── size       (content bytes of the whole chain)
//! └── views/<sha256(key)>/
//!     ├── key        (the caller's key)
//!     └── parent     (chain ID being viewed)
//! ```
//!
//! Commits are staged in a unique temporary directory and renamed into
//! place, so two tasks unpacking the same base layer never see each other's
//! partial work. View creation uses `mkdir`, which fails atomically if the
//! key is already taken.

pub mod native;
pub mod overlay;
pub mod unpack;

pub use native::NativeSnapshotter;
pub use overlay::OverlaySnapshotter;
pub use unpack::{LayerSource, WhiteoutMode};

use crate::error::{Error, Result};
use crate::identity::ChainId;
use crate::mount::Mount;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A snapshot driver.
pub trait Snapshotter: Send + Sync {
    /// Driver name (`overlay`, `native`).
    fn name(&self) -> &'static str;

    /// Returns true if `chain` has been committed.
    fn is_committed(&self, chain: &ChainId) -> bool;

    /// Applies one layer on top of `parent` and commits it as `chain`.
    ///
    /// Nothing is committed unless the layer's content matches its diff ID.
    fn commit_layer(&self, parent: Option<&ChainId>, chain: &ChainId, layer: LayerSource<'_>) -> Result<()>;

    /// Creates view `key` of `parent`.
    fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>>;

    /// Returns the mounts of view `key`.
    fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Removes view `key`.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Directory layout shared by both drivers.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotLayout {
    root: PathBuf,
}

impl SnapshotLayout {
    /// Creates the layout directories under `root`.
    pub(crate) fn create(root: &Path, driver: &str) -> Result<Self> {
        for dir in ["snapshots", "views"] {
            fs::create_dir_all(root.join(dir)).map_err(|e| Error::DriverInitFailed {
                driver: driver.to_string(),
                reason: format!("failed to create {}: {}", root.join(dir).display(), e),
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn committed_dir(&self, chain: &ChainId) -> PathBuf {
        self.root.join("snapshots").join(chain.hex())
    }

    /// Filesystem tree of a committed snapshot.
    pub(crate) fn committed_fs(&self, chain: &ChainId) -> PathBuf {
        self.committed_dir(chain).join("fs")
    }

    pub(crate) fn is_committed(&self, chain: &ChainId) -> bool {
        self.committed_fs(chain).is_dir()
    }

    /// Returns the parent of a committed snapshot.
    pub(crate) fn parent_of(&self, chain: &ChainId) -> Result<Option<ChainId>> {
        let path = self.committed_dir(chain).join("parent");
        match fs::read_to_string(&path) {
            Ok(parent) => Ok(Some(ChainId::parse(parent.trim())?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Content bytes of the full chain ending at `chain`.
    pub(crate) fn rootfs_size(&self, chain: &ChainId) -> Result<u64> {
        let path = self.committed_dir(chain).join("size");
        match fs::read_to_string(&path) {
            Ok(size) => size.trim().parse().map_err(|e| Error::SnapshotFailed {
                key: chain.to_string(),
                reason: format!("corrupt size record: {}", e),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the chain from `top` down to the base layer.
    pub(crate) fn lineage(&self, top: &ChainId) -> Result<Vec<ChainId>> {
        let mut chain = Vec::new();
        let mut current = Some(top.clone());

        while let Some(id) = current {
            if !self.is_committed(&id) {
                return Err(Error::SnapshotNotFound {
                    key: id.to_string(),
                });
            }
            current = self.parent_of(&id)?;
            chain.push(id);
        }

        Ok(chain)
    }

    /// Stages a commit and renames it into place.
    ///
    /// `fill` populates the staged `fs` directory given the parent chain's
    /// size and returns the bytes it added. If another task committed the
    /// same chain first, the staged copy is discarded.
    pub(crate) fn commit(
        &self,
        parent: Option<&ChainId>,
        chain: &ChainId,
        fill: impl FnOnce(&Path, u64) -> Result<u64>,
    ) -> Result<()> {
        if self.is_committed(chain) {
            return Ok(());
        }
        let below = match parent {
            Some(parent) => self.rootfs_size(parent)?,
            None => 0,
        };

        let staging = self
            .root
            .join("snapshots")
            .join(format!("tmp-{}", uuid::Uuid::now_v7()));
        let staging_fs = staging.join("fs");
        fs::create_dir_all(&staging_fs)?;

        let result = fill(&staging_fs, below).and_then(|added| {
            if let Some(parent) = parent {
                fs::write(staging.join("parent"), parent.as_str())?;
            }
            fs::write(staging.join("size"), (below + added).to_string())?;
            Ok(())
        });

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let final_dir = self.committed_dir(chain);
        if let Err(e) = fs::rename(&staging, &final_dir) {
            let _ = fs::remove_dir_all(&staging);
            if self.is_committed(chain) {
                debug!(chain_id = %chain, "snapshot committed concurrently, discarding staged copy");
                return Ok(());
            }
            return Err(Error::SnapshotFailed {
                key: chain.to_string(),
                reason: format!("failed to commit: {}", e),
            });
        }

        debug!(chain_id = %chain, "committed snapshot");
        Ok(())
    }

    fn view_dir(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join("views").join(name)
    }

    /// Records a new view, failing if `key` exists.
    pub(crate) fn create_view(&self, key: &str, parent: &ChainId) -> Result<()> {
        if !self.is_committed(parent) {
            return Err(Error::SnapshotNotFound {
                key: parent.to_string(),
            });
        }

        let dir = self.view_dir(key);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::SnapshotAlreadyExists {
                    key: key.to_string(),
                });
            }
            Err(e) => {
                return Err(Error::SnapshotFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let write = fs::write(dir.join("key"), key).and_then(|()| fs::write(dir.join("parent"), parent.as_str()));
        if let Err(e) = write {
            let _ = fs::remove_dir_all(&dir);
            return Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(())
    }

    /// Returns the chain a view was created from.
    pub(crate) fn view_parent(&self, key: &str) -> Result<ChainId> {
        let path = self.view_dir(key).join("parent");
        match fs::read_to_string(&path) {
            Ok(parent) => ChainId::parse(parent.trim()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::SnapshotNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Deletes a view record.
    pub(crate) fn remove_view(&self, key: &str) -> Result<()> {
        match fs::remove_dir_all(self.view_dir(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::SnapshotNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(Error::SnapshotFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Tries the preferred driver and falls back on initialization failure.
///
/// The failure of the preferred driver is logged at debug level only.
pub fn select_driver<P, F>(preferred: P, fallback: F) -> Result<Box<dyn Snapshotter>>
where
    P: FnOnce() -> Result<Box<dyn Snapshotter>>,
    F: FnOnce() -> Result<Box<dyn Snapshotter>>,
{
    match preferred() {
        Ok(driver) => {
            debug!(driver = driver.name(), "using preferred snapshotter");
            Ok(driver)
        }
        Err(e) => {
            debug!(error = %e, "error initializing preferred snapshotter");
            let driver = fallback().map_err(|e| Error::DriverInitFailed {
                driver: "fallback".to_string(),
                reason: e.to_string(),
            })?;
            debug!(driver = driver.name(), "falling back to snapshotter");
            Ok(driver)
        }
    }
}
