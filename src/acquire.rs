//! Acquisition & mount management for one image reference.
//!
//! [`with_mounted_root`] pulls the image, creates a view snapshot of its
//! chain ID, mounts it on a private directory and hands the path to a
//! continuation. Every resource is registered with a [`Teardown`] guard the
//! moment it is allocated; the guard releases them in reverse order on every
//! exit path, including the future being dropped mid-flight.

use crate::error::{Error, Result};
use crate::registry::PullOptions;
use crate::service::ImageService;
use std::future::Future;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

/// A resource to release.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    RemoveDir(PathBuf),
    RemoveSnapshot(String),
    Unmount(PathBuf),
}

/// Reverse-order cleanup stack for one acquisition.
///
/// Failures of individual steps are logged and never returned.
pub struct Teardown {
    service: Arc<dyn ImageService>,
    steps: Vec<Step>,
}

impl Teardown {
    fn new(service: Arc<dyn ImageService>) -> Self {
        Self {
            service,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Releases everything registered so far, newest first.
    pub async fn run(mut self) {
        let steps = std::mem::take(&mut self.steps);
        release(self.service.clone(), steps).await;
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }

        // Only reached when the owning future was dropped before `run`.
        let steps = std::mem::take(&mut self.steps);
        let service = self.service.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release(service, steps).in_current_span());
            }
            Err(_) => error!(pending = steps.len(), "no runtime to release snapshot resources"),
        }
    }
}

async fn release(service: Arc<dyn ImageService>, steps: Vec<Step>) {
    for step in steps.into_iter().rev() {
        match &step {
            Step::Unmount(target) => {
                debug!(target = %target.display(), "unmounting image rootfs");
                if let Err(e) = service.unmount(target).await {
                    error!(target = %target.display(), error = %e, "error unmounting image");
                }
            }
            Step::RemoveSnapshot(key) => {
                debug!(key = %key, "removing snapshot");
                if let Err(e) = service.remove(key).await {
                    warn!(key = %key, error = %e, "error removing snapshot");
                }
            }
            Step::RemoveDir(dir) => {
                // Non-recursive: a directory that still has content is
                // likely still mounted and must not be emptied.
                if let Err(e) = tokio::fs::remove_dir(dir).await {
                    warn!(target = %dir.display(), error = %e, "error removing mount target");
                }
            }
        }
    }
}

/// Creates a private (0700) mount target under `scratch`.
fn create_target(scratch: &Path, chain_hex: &str) -> Result<PathBuf> {
    let prefix = &chain_hex[..chain_hex.len().min(12)];
    let target = scratch.join(format!("{}-{}", prefix, uuid::Uuid::now_v7()));
    std::fs::DirBuilder::new()
        .mode(0o700)
        .create(&target)
        .map_err(|e| Error::MountFailed {
            target: target.clone(),
            reason: format!("error creating mount target: {}", e),
        })?;
    Ok(target)
}

/// Runs `f` with the image's root filesystem mounted read-only.
///
/// The snapshot key is the mount target path, so concurrent tasks scanning
/// the same image never share a snapshot. An existing snapshot with the same
/// key is reused rather than treated as an error.
pub async fn with_mounted_root<T, F, Fut>(
    service: Arc<dyn ImageService>,
    reference: &str,
    opts: &PullOptions,
    scratch: &Path,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    debug!("pulling image");
    let image = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        image = service.pull(reference, opts) => image?,
    };

    let chain_id = image.chain_id()?;
    debug!(chain_id = %chain_id, digest = %image.digest, "image pulled");

    let mut teardown = Teardown::new(service.clone());

    let target = create_target(scratch, chain_id.hex())?;
    teardown.push(Step::RemoveDir(target.clone()));
    let key = target.to_string_lossy().into_owned();

    let result = async {
        debug!(target = %target.display(), "creating snapshot");
        let mounts = match service.view(&key, &chain_id).await {
            Ok(mounts) => mounts,
            Err(e) if e.is_already_exists() => {
                debug!(key = %key, "snapshot exists, reusing its mounts");
                service.mounts(&key).await?
            }
            Err(e) => return Err(e),
        };
        teardown.push(Step::RemoveSnapshot(key.clone()));

        debug!(target = %target.display(), "mounting image rootfs");
        service.mount(&mounts, &target).await?;
        teardown.push(Step::Unmount(target.clone()));

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        f(target.clone()).await
    }
    .await;

    teardown.run().await;
    result
}
