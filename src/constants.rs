//! # Scanner Constants
//!
//! Defaults, environment variable names, resource limits and timeouts used
//! across the scanner. Limits bound the work a single hostile image can
//! cause; the defaults mirror what the CLI advertises in `--help`.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: Uses size limits and timeouts for image pulling
//! - [`crate::snapshot`]: Uses size limits for layer unpacking
//! - [`crate::cli`]: Uses defaults and environment variable names

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// The cumulative worst-case is MAX_LAYERS × MAX_LAYER_SIZE compressed, while
// MAX_ROOTFS_SIZE provides the actual extraction bound per image.
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// **Security**: Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed OCI layer (2 GiB).
///
/// **Attack Vector**: A malicious registry could serve infinite-length layers.
pub const MAX_LAYER_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum total extracted rootfs size (16 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest or config blob size read into memory (4 MiB).
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for image pull operations (10 minutes).
///
/// Includes manifest fetch and all layer downloads of one image.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// How long the embedded metadata database waits on a locked file.
pub const METADATA_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting on a judge process.
pub const JUDGE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Defaults
// =============================================================================

/// Default containerd socket.
pub const DEFAULT_CONTAINERD_ADDRESS: &str = "/run/containerd/containerd.sock";

/// Default namespace for image content.
pub const DEFAULT_NAMESPACE: &str = "binscan";

/// Directory under `$HOME` used for embedded storage.
pub const DEFAULT_ROOT_DIR: &str = "binscan";

/// Default output template: `<ref> <status> <data>`.
pub const DEFAULT_FORMAT: &str = "{{ result }}";

/// Default path pattern for the regex matcher.
pub const DEFAULT_MATCH_PATTERN: &str = "bin/(sh|bash|ssh|curl|wget|nc|csh|zsh|fish)$";

/// Default scan root for the target-binary matcher.
pub const DEFAULT_TARGET_PATH: &str = "/";

/// Snapshotter requested from a remote containerd.
pub const DEFAULT_REMOTE_SNAPSHOTTER: &str = "overlayfs";

/// Preferred embedded snapshot driver.
pub const OVERLAY_DRIVER: &str = "overlay";

/// Portable fallback snapshot driver.
pub const NATIVE_DRIVER: &str = "native";

// =============================================================================
// Environment
// =============================================================================

/// Remote store address.
pub const ENV_CONTAINERD_ADDRESS: &str = "CONTAINERD_ADDRESS";

/// Content namespace.
pub const ENV_CONTAINERD_NAMESPACE: &str = "CONTAINERD_NAMESPACE";

/// Output template.
pub const ENV_OUTPUT_FORMAT: &str = "OUTPUT_FORMAT";

/// Comma separated scan roots for the target-binary matcher.
pub const ENV_TARGET_PATHS: &str = "TARGET_PATHS";

/// Comma separated binary names for the target-binary matcher.
pub const ENV_TARGET_BINS: &str = "TARGET_BINS";

/// Log filter directives.
pub const ENV_LOG: &str = "BINSCAN_LOG";

// =============================================================================
// Storage Layout
// =============================================================================

/// Subdirectory of the root holding all embedded store data.
pub const DATA_DIR: &str = "data";

/// Blob store directory under the data dir.
pub const CONTENT_DIR: &str = "content";

/// Metadata database file under the data dir.
pub const METADATA_DB: &str = "metadata.db";

/// Header carrying the containerd namespace on every request.
pub const NAMESPACE_HEADER: &str = "containerd-namespace";
