//! # Content Store
//!
//! Digest-addressed blobs for the embedded image service: manifests, image
//! configs and compressed layers. Images that share base layers fetch them
//! once.
//!
//! ## Layout
//!
//! ```text
//! <root>/data/content/
//! └── sha256/
//!     ├── ab/
//!     │   └── abcd1234...  (blob content)
//!     └── cd/
//!         └── cdef5678...  (blob content)
//! ```
//!
//! ## Guarantees
//!
//! - Nothing is stored before its sha256 matches the claimed digest.
//! - Paths are derived from hex characters only and stay under the root.
//! - A blob becomes visible through a rename, never half-written.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Algorithms a digest may name when building a path.
const PATH_ALGORITHMS: &[&str] = &["sha256", "sha384", "sha512"];

/// Splits `algo:hex`; a bare hex string is taken as sha256.
fn split_digest(digest: &str) -> (&str, &str) {
    digest.split_once(':').unwrap_or(("sha256", digest))
}

/// Blob store shared by every pull of a run.
///
/// Writers of the same digest race benignly: each writes a private temp file
/// and the last rename wins with identical bytes.
#[derive(Debug)]
pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) a store rooted at `base_dir`.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        if let Err(e) = fs::create_dir_all(&base_dir) {
            return Err(Error::StorageInitFailed {
                path: base_dir,
                reason: e.to_string(),
            });
        }
        debug!(path = %base_dir.display(), "content store opened");
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Reads a whole blob. Used for manifests and configs.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|_| not_found(digest))
    }

    /// Opens a blob for streaming. Used for layers during unpack.
    pub fn open_blob(&self, digest: &str) -> Result<File> {
        File::open(self.blob_path(digest)).map_err(|_| not_found(digest))
    }

    /// Maps a digest to its on-disk location.
    ///
    /// Non-hex characters are dropped and unknown algorithms fall back to
    /// the sha256 directory, so the result always stays under the store.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = split_digest(digest);
        let algo = if PATH_ALGORITHMS.contains(&algo) {
            algo
        } else {
            warn!(algorithm = algo, "unknown digest algorithm");
            "sha256"
        };

        let hex_only: String = hash.chars().filter(char::is_ascii_hexdigit).collect();
        if hex_only.len() != hash.len() {
            warn!(digest, "dropping non-hex characters from digest");
        }
        if hex_only.is_empty() {
            return self.base_dir.join("invalid").join("empty");
        }

        let shard = &hex_only[..hex_only.len().min(2)];
        self.base_dir.join(algo).join(shard).join(&hex_only)
    }

    /// Verifies `data` against a sha256 `digest` and stores it.
    ///
    /// A blob that is already present is left untouched.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected) = split_digest(digest);
        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}' for {}",
                algo, digest
            )));
        }

        let actual = hex::encode(Sha256::digest(data));
        if actual != expected {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch for {}: content hashes to sha256:{}",
                digest, actual
            )));
        }

        let dest = self.blob_path(digest);
        if dest.is_file() {
            debug!(digest, "blob cached");
            return Ok(());
        }

        let write_err = |e: std::io::Error| Error::StorageWriteFailed(format!("{}: {}", dest.display(), e));
        if let Some(shard) = dest.parent() {
            fs::create_dir_all(shard).map_err(write_err)?;
        }

        let staging = dest.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        let staged = fs::write(&staging, data).and_then(|()| fs::rename(&staging, &dest));
        if let Err(e) = staged {
            let _ = fs::remove_file(&staging);
            return Err(write_err(e));
        }

        debug!(digest, bytes = data.len(), "blob stored");
        Ok(())
    }
}

fn not_found(digest: &str) -> Error {
    Error::BlobNotFound {
        digest: digest.to_string(),
    }
}
