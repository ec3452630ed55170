//! Manifest builder.
//!
//! Walks a mounted root filesystem and records every entry as a
//! [`Resource`]. Regular files that share an inode are merged into a single
//! resource listing every path, in the order the walk found them. The walk
//! never follows symlinks and visits directory entries in lexical order, so
//! two builds of the same tree produce the same manifest.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use tracing::debug;

/// Extended attributes, name to raw value.
pub type XAttrs = BTreeMap<String, Vec<u8>>;

/// Kind of a non-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Regular => "regular",
            FileKind::Symlink => "symlink",
            FileKind::CharDevice => "chardevice",
            FileKind::BlockDevice => "blockdevice",
            FileKind::Fifo => "fifo",
            FileKind::Socket => "socket",
        }
    }
}

/// Ownership and mode shared by every resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Meta {
    /// Full `st_mode`, including the file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Meta {
    /// Permission bits (including setuid/setgid/sticky).
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// A non-directory entry. `paths` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResource {
    pub paths: Vec<String>,
    pub kind: FileKind,
    #[serde(flatten)]
    pub meta: Meta,
    pub size: u64,
    pub digests: Vec<String>,
    #[serde(serialize_with = "serialize_xattrs")]
    pub xattrs: XAttrs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A directory. Directories carry no digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryResource {
    pub path: String,
    #[serde(flatten)]
    pub meta: Meta,
    #[serde(serialize_with = "serialize_xattrs")]
    pub xattrs: XAttrs,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Resource {
    File(FileResource),
    Directory(DirectoryResource),
}

impl Resource {
    /// First (or only) path of the resource.
    pub fn path(&self) -> &str {
        match self {
            Resource::File(f) => f.paths.first().map(String::as_str).unwrap_or_default(),
            Resource::Directory(d) => &d.path,
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Resource::File(f) => &f.meta,
            Resource::Directory(d) => &d.meta,
        }
    }
}

/// Ordered resources discovered on a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub resources: Vec<Resource>,
}

impl Manifest {
    /// Walks `root` and builds its manifest.
    pub fn build(root: &Path) -> Result<Self> {
        let mut builder = Builder {
            root,
            resources: Vec::new(),
            links: HashMap::new(),
        };
        builder.walk_dir(root)?;
        debug!(root = %root.display(), resources = builder.resources.len(), "built manifest");
        Ok(Self {
            resources: builder.resources,
        })
    }

    /// Non-directory resources in manifest order.
    pub fn files(&self) -> impl Iterator<Item = &FileResource> {
        self.resources.iter().filter_map(|r| match r {
            Resource::File(f) => Some(f),
            Resource::Directory(_) => None,
        })
    }

    /// Human-readable rendering, one resource per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for resource in &self.resources {
            match resource {
                Resource::Directory(d) => {
                    let _ = write!(
                        out,
                        "{}/ mode={:04o} uid={} gid={}",
                        d.path,
                        d.meta.permissions(),
                        d.meta.uid,
                        d.meta.gid
                    );
                }
                Resource::File(f) => {
                    let _ = write!(
                        out,
                        "{} type={} mode={:04o} uid={} gid={} size={}",
                        f.paths.join(","),
                        f.kind.as_str(),
                        f.meta.permissions(),
                        f.meta.uid,
                        f.meta.gid,
                        f.size
                    );
                    for digest in &f.digests {
                        let _ = write!(out, " digest={}", digest);
                    }
                    if let Some(target) = &f.target {
                        let _ = write!(out, " target={}", target);
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    /// Machine-readable rendering.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn serialize_xattrs<S: Serializer>(xattrs: &XAttrs, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeMap;

    let mut map = serializer.serialize_map(Some(xattrs.len()))?;
    for (name, value) in xattrs {
        map.serialize_entry(name, &STANDARD.encode(value))?;
    }
    map.end()
}

struct Builder<'a> {
    root: &'a Path,
    resources: Vec<Resource>,
    /// (dev, ino) of multiply-linked files to their resource index.
    links: HashMap<(u64, u64), usize>,
}

impl Builder<'_> {
    fn walk_err(&self, path: &Path, e: impl std::fmt::Display) -> Error {
        Error::ManifestBuildFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }

    /// Root-relative path with a leading `/`.
    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(self.root).unwrap_or(path);
        format!("/{}", rel.to_string_lossy())
    }

    fn walk_dir(&mut self, dir: &Path) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| self.walk_err(dir, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| self.walk_err(dir, e))?;
        entries.sort();

        for path in entries {
            let md = fs::symlink_metadata(&path).map_err(|e| self.walk_err(&path, e))?;
            let meta = Meta {
                mode: md.mode(),
                uid: md.uid(),
                gid: md.gid(),
            };
            let rel = self.relative(&path);
            let xattrs = read_xattrs(&path).map_err(|e| self.walk_err(&path, e))?;
            let file_type = md.file_type();

            if file_type.is_dir() {
                self.resources.push(Resource::Directory(DirectoryResource {
                    path: rel,
                    meta,
                    xattrs,
                }));
                self.walk_dir(&path)?;
                continue;
            }

            let kind = if file_type.is_file() {
                FileKind::Regular
            } else if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_char_device() {
                FileKind::CharDevice
            } else if file_type.is_block_device() {
                FileKind::BlockDevice
            } else if file_type.is_fifo() {
                FileKind::Fifo
            } else {
                FileKind::Socket
            };

            if kind == FileKind::Regular && md.nlink() > 1 {
                let id = (md.dev(), md.ino());
                if let Some(&index) = self.links.get(&id) {
                    if let Resource::File(existing) = &mut self.resources[index] {
                        existing.paths.push(rel);
                    }
                    continue;
                }
                self.links.insert(id, self.resources.len());
            }

            let (size, digests) = match kind {
                FileKind::Regular => (md.size(), vec![digest_file(&path).map_err(|e| self.walk_err(&path, e))?]),
                _ => (0, Vec::new()),
            };
            let target = match kind {
                FileKind::Symlink => Some(
                    fs::read_link(&path)
                        .map_err(|e| self.walk_err(&path, e))?
                        .to_string_lossy()
                        .into_owned(),
                ),
                _ => None,
            };

            self.resources.push(Resource::File(FileResource {
                paths: vec![rel],
                kind,
                meta,
                size,
                digests,
                xattrs,
                target,
            }));
        }

        Ok(())
    }
}

fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Reads extended attributes without following symlinks. Filesystems
/// without xattr support yield an empty map.
#[cfg(target_os = "linux")]
fn read_xattrs(path: &Path) -> std::io::Result<XAttrs> {
    use std::ffi::CString;
    use std::io::Error as IoError;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let unsupported = |e: &IoError| matches!(e.raw_os_error(), Some(libc::ENOTSUP) | Some(libc::ENODATA));

    let len = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if len < 0 {
        let e = IoError::last_os_error();
        return if unsupported(&e) { Ok(XAttrs::new()) } else { Err(e) };
    }
    if len == 0 {
        return Ok(XAttrs::new());
    }

    let mut names = vec![0u8; len as usize];
    let len = unsafe { libc::llistxattr(c_path.as_ptr(), names.as_mut_ptr().cast(), names.len()) };
    if len < 0 {
        return Err(IoError::last_os_error());
    }
    names.truncate(len as usize);

    let mut xattrs = XAttrs::new();
    for name in names.split(|b| *b == 0).filter(|n| !n.is_empty()) {
        let c_name = CString::new(name)?;
        let size = unsafe { libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let e = IoError::last_os_error();
            if unsupported(&e) {
                continue;
            }
            return Err(e);
        }

        let mut value = vec![0u8; size as usize];
        let size = unsafe {
            libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), value.as_mut_ptr().cast(), value.len())
        };
        if size < 0 {
            return Err(IoError::last_os_error());
        }
        value.truncate(size as usize);

        xattrs.insert(String::from_utf8_lossy(name).into_owned(), value);
    }

    Ok(xattrs)
}

#[cfg(not(target_os = "linux"))]
fn read_xattrs(_path: &Path) -> std::io::Result<XAttrs> {
    Ok(XAttrs::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("bin/busybox"), b"busybox").unwrap();
        fs::hard_link(root.join("bin/busybox"), root.join("bin/sh")).unwrap();
        std::os::unix::fs::symlink("/bin/busybox", root.join("bin/ls")).unwrap();
        fs::write(root.join("usr/bin/curl"), b"curl").unwrap();
        dir
    }

    #[test]
    fn test_build_orders_and_groups_links() {
        let dir = fixture();
        let manifest = Manifest::build(dir.path()).unwrap();

        let paths: Vec<_> = manifest.resources.iter().map(|r| r.path().to_string()).collect();
        assert_eq!(paths, vec!["/bin", "/bin/busybox", "/bin/ls", "/usr", "/usr/bin", "/usr/bin/curl"]);

        let busybox = manifest.files().next().unwrap();
        assert_eq!(busybox.paths, vec!["/bin/busybox".to_string(), "/bin/sh".to_string()]);
        assert_eq!(busybox.kind, FileKind::Regular);
        assert_eq!(busybox.size, 7);
        assert_eq!(
            busybox.digests,
            vec![format!("sha256:{}", hex::encode(Sha256::digest(b"busybox")))]
        );
    }

    #[test]
    fn test_symlinks_are_not_followed() {
        let dir = fixture();
        let manifest = Manifest::build(dir.path()).unwrap();
        let ls = manifest.files().find(|f| f.paths[0] == "/bin/ls").unwrap();
        assert_eq!(ls.kind, FileKind::Symlink);
        assert!(ls.digests.is_empty());
        assert_eq!(ls.target.as_deref(), Some("/bin/busybox"));
    }

    #[test]
    fn test_directories_have_no_digests_and_are_excluded_from_files() {
        let dir = fixture();
        let manifest = Manifest::build(dir.path()).unwrap();
        assert_eq!(manifest.files().count(), 3);
        assert!(
            manifest
                .resources
                .iter()
                .filter(|r| matches!(r, Resource::Directory(_)))
                .all(|r| r.meta().mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32)
        );
    }

    #[test]
    fn test_renderings() {
        let dir = fixture();
        let manifest = Manifest::build(dir.path()).unwrap();

        let text = manifest.to_text();
        assert_eq!(text.lines().count(), manifest.resources.len());
        assert!(text.contains("/bin/busybox,/bin/sh type=regular"));
        assert!(text.contains("target=/bin/busybox"));

        let json: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["resources"][0]["type"], "directory");
        assert_eq!(json["resources"][1]["paths"][1], "/bin/sh");
    }

    #[test]
    fn test_missing_root_is_walk_error() {
        let dir = TempDir::new().unwrap();
        let result = Manifest::build(&dir.path().join("missing"));
        assert!(matches!(result, Err(Error::ManifestBuildFailed { .. })));
    }
}
