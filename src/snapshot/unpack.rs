//! Layer tar application with OCI whiteout handling.

use crate::constants::MAX_ROOTFS_SIZE;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::debug;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// How whiteout entries are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutMode {
    /// Delete the shadowed path from a tree that already holds the parent.
    Delete,
    /// Record whiteouts the way overlayfs expects them in an upper layer:
    /// `0:0` character devices and the `trusted.overlay.opaque` xattr.
    Overlay,
}

/// A layer blob as stored, plus the diff ID the image config declares for it.
pub struct LayerSource<'a> {
    /// Digest of the blob (compressed or not).
    pub digest: &'a str,
    /// Expected sha256 of the uncompressed tar stream.
    pub diff_id: &'a str,
    pub reader: &'a mut dyn Read,
}

/// Hashes everything read through it.
struct DiffIdReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for DiffIdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<R: Read> DiffIdReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Drains what the consumer left unread (tar padding) and returns the digest.
    fn finish(mut self) -> io::Result<String> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(format!("sha256:{}", hex::encode(self.hasher.finalize())))
    }
}

/// Wraps `layer` in the decompressor its magic bytes call for.
fn decompress<'a>(layer: &'a mut dyn Read, digest: &str) -> Result<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(layer);
    let head = reader.fill_buf().map_err(|e| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    })?;
    let (gzip, zstd) = (head.starts_with(&GZIP_MAGIC), head.starts_with(&ZSTD_MAGIC));

    if gzip {
        Ok(Box::new(GzDecoder::new(reader)))
    } else if zstd {
        Err(Error::LayerExtractionFailed {
            digest: digest.to_string(),
            reason: "zstd compressed layers are not supported".to_string(),
        })
    } else {
        Ok(Box::new(reader))
    }
}

/// Fails unless the uncompressed content of `digest` hashed to `expected`.
pub fn check_diff_id(digest: &str, expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    Err(Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: format!("diff ID mismatch: config declares {}, content is {}", expected, actual),
    })
}

/// Computes the diff ID of a layer blob without unpacking it.
pub fn diff_id_of(layer: &mut dyn Read, digest: &str) -> Result<String> {
    let stream = decompress(layer, digest)?;
    DiffIdReader::new(stream).finish().map_err(|e| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    })
}

/// Applies one layer tarball (gzip or uncompressed) onto `dest`.
///
/// `below` is the size of the rootfs the layer lands on; the sum may not
/// exceed `MAX_ROOTFS_SIZE`. The uncompressed stream must hash to
/// `layer.diff_id`, otherwise the error leaves `dest` partially written and
/// the caller discards it. Returns the number of content bytes written.
pub fn apply_layer(layer: LayerSource<'_>, dest: &Path, mode: WhiteoutMode, below: u64) -> Result<u64> {
    let digest = layer.digest;
    let extract_err = |e: io::Error| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    };

    let mut stream = DiffIdReader::new(decompress(layer.reader, digest)?);
    let mut archive = Archive::new(&mut stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);
    archive.set_preserve_ownerships(running_as_root());

    let mut written = 0u64;

    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let raw_path = entry.path().map_err(extract_err)?.into_owned();
        let Some(path) = sanitize(&raw_path)? else {
            continue;
        };

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        if filename == OPAQUE_WHITEOUT {
            let dir = confined(dest, parent, true)?;
            apply_opaque(&dir, mode).map_err(extract_err)?;
            continue;
        }
        if let Some(hidden) = filename.strip_prefix(WHITEOUT_PREFIX) {
            let shadowed = whiteout_target(parent, hidden, &raw_path)?;
            apply_whiteout(&confined(dest, &shadowed, false)?, mode).map_err(extract_err)?;
            continue;
        }

        written += entry.size();
        if below + written > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: below + written,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        let target = confined(dest, &path, false)?;
        replace_conflicting(&target, entry.header().entry_type().is_dir()).map_err(extract_err)?;
        entry.unpack_in(dest).map_err(extract_err)?;
    }
    drop(archive);

    let actual = stream.finish().map_err(extract_err)?;
    check_diff_id(digest, layer.diff_id, &actual)?;

    debug!(digest, diff_id = %actual, bytes = written, "applied layer");
    Ok(written)
}

/// Normalizes an entry path to a relative path inside the layer.
///
/// `./` prefixes are dropped; `..` and absolute paths are rejected. Returns
/// `None` for the root entry itself.
fn sanitize(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().into_owned(),
                });
            }
        }
    }
    Ok(if clean.as_os_str().is_empty() { None } else { Some(clean) })
}

/// The path a `.wh.<name>` entry hides. `<name>` must be a plain file name.
fn whiteout_target(parent: &Path, hidden: &str, raw: &Path) -> Result<PathBuf> {
    let mut parts = Path::new(hidden).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(name)), None) => Ok(parent.join(name)),
        _ => Err(Error::PathTraversal {
            path: raw.to_string_lossy().into_owned(),
        }),
    }
}

/// Joins the sanitized `rel` onto `dest`, refusing to pass through a symlink.
///
/// Intermediate components are checked with `lstat`; the final one only when
/// `include_last` is set, since removing a symlink itself is harmless. The
/// walk stops at the first component that is missing or not a directory.
fn confined(dest: &Path, rel: &Path, include_last: bool) -> Result<PathBuf> {
    let count = rel.components().count();
    let checked = if include_last { count } else { count.saturating_sub(1) };

    let mut current = dest.to_path_buf();
    let mut walking = true;
    for (i, part) in rel.components().enumerate() {
        current.push(part);
        if !walking || i >= checked {
            continue;
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: rel.to_string_lossy().into_owned(),
                });
            }
            Ok(meta) => walking = meta.is_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => walking = false,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(current)
}

/// A directory replacing a file (or the reverse) must remove the old entry first.
fn replace_conflicting(target: &Path, incoming_dir: bool) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_dir() && !incoming_dir {
        fs::remove_dir_all(target)
    } else if !meta.is_dir() && incoming_dir {
        fs::remove_file(target)
    } else {
        Ok(())
    }
}

fn remove_path(target: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_whiteout(target: &Path, mode: WhiteoutMode) -> std::io::Result<()> {
    match mode {
        WhiteoutMode::Delete => remove_path(target),
        WhiteoutMode::Overlay => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            remove_path(target)?;
            overlay::mark_whiteout(target)
        }
    }
}

fn apply_opaque(dir: &Path, mode: WhiteoutMode) -> std::io::Result<()> {
    match mode {
        WhiteoutMode::Delete => {
            // Keep the directory, drop everything the lower layers put in it.
            match fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries {
                        remove_path(&entry?.path())?;
                    }
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        }
        WhiteoutMode::Overlay => {
            fs::create_dir_all(dir)?;
            overlay::mark_opaque(dir)
        }
    }
}

pub(crate) fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(target_os = "linux")]
mod overlay {
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    pub(super) fn mark_whiteout(target: &Path) -> std::io::Result<()> {
        mknod(target, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0)).map_err(std::io::Error::from)
    }

    pub(super) fn mark_opaque(dir: &Path) -> std::io::Result<()> {
        let path = CString::new(dir.as_os_str().as_bytes())?;
        let name = c"trusted.overlay.opaque";
        let value = b"y";
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod overlay {
    use std::path::Path;

    pub(super) fn mark_whiteout(_target: &Path) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "overlay whiteouts require Linux"))
    }

    pub(super) fn mark_opaque(_dir: &Path) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "overlay whiteouts require Linux"))
    }
}
