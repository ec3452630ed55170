//! Error types for the image scanning pipeline.
//!
//! Errors fall into two classes. Startup errors (configuration, store
//! bootstrap, template parsing) abort the whole run before any image is
//! touched. Everything else is scoped to a single image reference and ends up
//! in that reference's [`ScanResult`](crate::result::ScanResult).

use std::path::PathBuf;

/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scanning images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid command line or environment configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Output or match template failed to parse.
    #[error("invalid {name} template: {reason}")]
    InvalidTemplate { name: String, reason: String },

    /// Regular expression failed to compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// Metadata database failure.
    #[error("metadata database error: {0}")]
    Metadata(String),

    /// Snapshot driver could not be initialized.
    #[error("failed to initialize {driver} snapshotter: {reason}")]
    DriverInitFailed { driver: String, reason: String },

    /// Remote image service could not be reached.
    #[error("failed to connect to {address}: {reason}")]
    RemoteUnavailable { address: String, reason: String },

    /// Remote image service returned an error.
    #[error("remote {operation} failed: {reason}")]
    Remote { operation: String, reason: String },

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Image config is missing or malformed.
    #[error("invalid image config for '{reference}': {reason}")]
    InvalidImageConfig { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Snapshot/Mount Errors
    // =========================================================================
    /// Snapshot key is already in use.
    #[error("snapshot {key} already exists")]
    SnapshotAlreadyExists { key: String },

    /// Snapshot key is unknown.
    #[error("snapshot {key} not found")]
    SnapshotNotFound { key: String },

    /// Any other snapshot failure.
    #[error("snapshot {key} failed: {reason}")]
    SnapshotFailed { key: String, reason: String },

    /// Mounting the snapshot failed.
    #[error("failed to mount rootfs at {target}: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    /// Unmounting failed.
    #[error("failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    // =========================================================================
    // Scan Errors
    // =========================================================================
    /// Walking the mounted root failed.
    #[error("failed to build manifest at {path}: {reason}")]
    ManifestBuildFailed { path: PathBuf, reason: String },

    /// Evaluating the match rule against a path failed.
    #[error("error matching {path}: {reason}")]
    MatchFailed { path: String, reason: String },

    /// The run was cancelled before this operation finished.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation not supported on this platform.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for the recoverable "snapshot already exists" condition.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::SnapshotAlreadyExists { .. })
    }

    /// Returns true for errors that abort the run before any task starts.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::InvalidTemplate { .. }
                | Self::InvalidPattern { .. }
                | Self::StorageInitFailed { .. }
                | Self::Metadata(_)
                | Self::DriverInitFailed { .. }
                | Self::RemoteUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
