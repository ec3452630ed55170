//! Native (copy) snapshotter.
//!
//! Every committed snapshot holds the complete filesystem tree: the parent is
//! copied and the layer applied on top, deleting whited-out paths. Views are
//! read-only bind mounts of a committed tree. Works on any filesystem.

use super::unpack::{self, LayerSource, WhiteoutMode};
use super::{SnapshotLayout, Snapshotter};
use crate::constants::NATIVE_DRIVER;
use crate::error::{Error, Result};
use crate::identity::ChainId;
use crate::mount::Mount;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Copy-based snapshot driver.
#[derive(Debug)]
pub struct NativeSnapshotter {
    layout: SnapshotLayout,
}

impl NativeSnapshotter {
    /// Initializes the driver under `root`.
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            layout: SnapshotLayout::create(root, NATIVE_DRIVER)?,
        })
    }
}

impl Snapshotter for NativeSnapshotter {
    fn name(&self) -> &'static str {
        NATIVE_DRIVER
    }

    fn is_committed(&self, chain: &ChainId) -> bool {
        self.layout.is_committed(chain)
    }

    fn commit_layer(&self, parent: Option<&ChainId>, chain: &ChainId, layer: LayerSource<'_>) -> Result<()> {
        let parent_fs = match parent {
            Some(parent) if !self.layout.is_committed(parent) => {
                return Err(Error::SnapshotNotFound {
                    key: parent.to_string(),
                });
            }
            Some(parent) => Some(self.layout.committed_fs(parent)),
            None => None,
        };

        self.layout.commit(parent, chain, |fs, below| {
            if let Some(parent_fs) = &parent_fs {
                copy_tree(parent_fs, fs)?;
            }
            unpack::apply_layer(layer, fs, WhiteoutMode::Delete, below)
        })
    }

    fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>> {
        self.layout.create_view(key, parent)?;
        self.mounts(key)
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let parent = self.layout.view_parent(key)?;
        Ok(vec![Mount::read_only_bind(&self.layout.committed_fs(&parent))])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.layout.remove_view(key)
    }
}

/// Recursively copies `src` into the existing directory `dst`.
///
/// Preserves symlinks, hard links, permission bits and (when root)
/// ownership. Special files are recreated where possible and skipped
/// otherwise.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut links = HashMap::new();
    copy_dir_contents(src, dst, &mut links, unpack::running_as_root())?;
    let meta = fs::symlink_metadata(src)?;
    fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    Ok(())
}

fn copy_dir_contents(
    src: &Path,
    dst: &Path,
    links: &mut HashMap<(u64, u64), PathBuf>,
    preserve_owner: bool,
) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir(&to)?;
            copy_dir_contents(&from, &to, links, preserve_owner)?;
            fs::set_permissions(&to, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_file() {
            let id = (meta.dev(), meta.ino());
            match links.get(&id) {
                Some(first) if meta.nlink() > 1 => fs::hard_link(first, &to)?,
                _ => {
                    fs::copy(&from, &to)?;
                    if meta.nlink() > 1 {
                        links.insert(id, to.clone());
                    }
                }
            }
        } else if let Err(e) = copy_special(&meta, &to) {
            debug!(path = %from.display(), error = %e, "skipping special file");
            continue;
        }

        if preserve_owner {
            std::os::unix::fs::lchown(&to, Some(meta.uid()), Some(meta.gid()))?;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn copy_special(meta: &fs::Metadata, to: &Path) -> std::io::Result<()> {
    use nix::sys::stat::{Mode, SFlag, mknod};

    let kind = SFlag::from_bits_truncate(meta.mode() & SFlag::S_IFMT.bits());
    let perm = Mode::from_bits_truncate(meta.mode() & 0o7777);
    mknod(to, kind, perm, meta.rdev()).map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn copy_special(_meta: &fs::Metadata, _to: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "special files"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn diff_id(tar: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        format!("sha256:{}", hex::encode(Sha256::digest(tar)))
    }

    fn commit(driver: &NativeSnapshotter, parent: Option<&ChainId>, chain: &ChainId, tar: &[u8]) -> Result<()> {
        let expected = diff_id(tar);
        let source = LayerSource {
            digest: "sha256:blob",
            diff_id: &expected,
            reader: &mut &tar[..],
        };
        driver.commit_layer(parent, chain, source)
    }

    #[test]
    fn test_copy_tree_preserves_links() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir(&dst).unwrap();
        fs::write(src.join("bin/busybox"), "bb").unwrap();
        fs::hard_link(src.join("bin/busybox"), src.join("bin/sh")).unwrap();
        std::os::unix::fs::symlink("busybox", src.join("bin/ls")).unwrap();

        copy_tree(&src, &dst).unwrap();

        let a = fs::metadata(dst.join("bin/busybox")).unwrap();
        let b = fs::metadata(dst.join("bin/sh")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(fs::read_link(dst.join("bin/ls")).unwrap(), PathBuf::from("busybox"));
    }

    #[test]
    fn test_commit_chain_and_view() {
        let dir = TempDir::new().unwrap();
        let driver = NativeSnapshotter::new(dir.path()).unwrap();

        let base = layer(&[("bin/sh", b"sh"), ("bin/bash", b"bash")]);
        let upper = layer(&[("bin/.wh.sh", b""), ("bin/curl", b"curl")]);
        let ids = crate::identity::chain_ids(&[diff_id(&base), diff_id(&upper)]).unwrap();

        commit(&driver, None, &ids[0], &base).unwrap();
        commit(&driver, Some(&ids[0]), &ids[1], &upper).unwrap();

        let mounts = driver.view("view-1", &ids[1]).unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].is_bind());

        let tree = PathBuf::from(&mounts[0].source);
        assert!(tree.join("bin/curl").exists());
        assert!(tree.join("bin/bash").exists());
        assert!(!tree.join("bin/sh").exists());

        // Lower snapshot is untouched by the upper layer.
        assert!(driver.layout.committed_fs(&ids[0]).join("bin/sh").exists());
    }

    #[test]
    fn test_view_twice_then_recover() {
        let dir = TempDir::new().unwrap();
        let driver = NativeSnapshotter::new(dir.path()).unwrap();
        let base = layer(&[("bin/sh", b"sh")]);
        let id = ChainId::from_diff_ids(&[diff_id(&base)]).unwrap();
        commit(&driver, None, &id, &base).unwrap();

        driver.view("k", &id).unwrap();
        let err = driver.view("k", &id).unwrap_err();
        assert!(err.is_already_exists());

        let mounts = driver.mounts("k").unwrap();
        assert_eq!(mounts, driver.mounts("k").unwrap());
        driver.remove("k").unwrap();
        assert!(driver.mounts("k").is_err());
    }

    #[test]
    fn test_commit_requires_parent() {
        let dir = TempDir::new().unwrap();
        let driver = NativeSnapshotter::new(dir.path()).unwrap();
        let ids = crate::identity::chain_ids(&[
            format!("sha256:{}", "4".repeat(64)),
            format!("sha256:{}", "5".repeat(64)),
        ])
        .unwrap();
        let data = layer(&[("x", b"x")]);
        let result = commit(&driver, Some(&ids[0]), &ids[1], &data);
        assert!(matches!(result, Err(Error::SnapshotNotFound { .. })));
    }
}
