//! Overlay snapshotter.
//!
//! Each layer is unpacked once into its own directory; a view stacks the
//! chain's directories as overlay `lowerdir`s. Requires overlayfs in the
//! running kernel and root privileges (whiteouts are device nodes and the
//! opaque marker lives in the `trusted.` xattr namespace).

use super::unpack::{self, LayerSource, WhiteoutMode};
use super::{SnapshotLayout, Snapshotter};
use crate::constants::OVERLAY_DRIVER;
use crate::error::{Error, Result};
use crate::identity::ChainId;
use crate::mount::Mount;
use std::path::Path;

/// Overlay-backed snapshot driver.
#[derive(Debug)]
pub struct OverlaySnapshotter {
    layout: SnapshotLayout,
}

impl OverlaySnapshotter {
    /// Initializes the driver under `root`.
    ///
    /// Fails if the kernel lacks overlayfs or the process is not root.
    pub fn new(root: &Path) -> Result<Self> {
        let init_err = |reason: String| Error::DriverInitFailed {
            driver: OVERLAY_DRIVER.to_string(),
            reason,
        };

        if !cfg!(target_os = "linux") {
            return Err(init_err("overlayfs requires Linux".to_string()));
        }

        let filesystems = std::fs::read_to_string("/proc/filesystems")
            .map_err(|e| init_err(format!("failed to read /proc/filesystems: {}", e)))?;
        if !supports_overlay(&filesystems) {
            return Err(init_err("overlay filesystem not supported by kernel".to_string()));
        }

        if !unpack::running_as_root() {
            return Err(init_err("overlay snapshots require root".to_string()));
        }

        Ok(Self {
            layout: SnapshotLayout::create(root, OVERLAY_DRIVER)?,
        })
    }
}

/// Scans `/proc/filesystems` contents for an `overlay` entry.
fn supports_overlay(filesystems: &str) -> bool {
    filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == "overlay")
}

impl Snapshotter for OverlaySnapshotter {
    fn name(&self) -> &'static str {
        OVERLAY_DRIVER
    }

    fn is_committed(&self, chain: &ChainId) -> bool {
        self.layout.is_committed(chain)
    }

    fn commit_layer(&self, parent: Option<&ChainId>, chain: &ChainId, layer: LayerSource<'_>) -> Result<()> {
        if let Some(parent) = parent
            && !self.layout.is_committed(parent)
        {
            return Err(Error::SnapshotNotFound {
                key: parent.to_string(),
            });
        }

        self.layout
            .commit(parent, chain, |fs, below| unpack::apply_layer(layer, fs, WhiteoutMode::Overlay, below))
    }

    fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>> {
        self.layout.create_view(key, parent)?;
        self.mounts(key)
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let parent = self.layout.view_parent(key)?;
        let lower: Vec<_> = self
            .layout
            .lineage(&parent)?
            .iter()
            .map(|id| self.layout.committed_fs(id))
            .collect();

        // overlayfs needs two lowerdirs when there is no upperdir.
        Ok(match lower.as_slice() {
            [single] => vec![Mount::read_only_bind(single)],
            _ => vec![Mount::read_only_overlay(&lower)],
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.layout.remove_view(key)
    }
}
