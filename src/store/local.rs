//! Embedded image service.
//!
//! Backs [`ImageService`] with the local blob store, the metadata database
//! and one snapshot driver picked at startup. Pulling downloads into the blob
//! store and then commits one snapshot per layer chain. Every layer's
//! content is checked against the config's diff ID, including layers whose
//! chain an earlier pull (or a concurrent task) already committed.

use super::metadata::MetadataDb;
use crate::error::Result;
use crate::identity::{self, ChainId};
use crate::mount::Mount;
use crate::registry::{self, PullOptions, PulledImage};
use crate::service::{ImageHandle, ImageService, run_blocking};
use crate::snapshot::{LayerSource, Snapshotter, unpack};
use crate::storage::BlobStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Image service backed by local storage.
pub struct LocalStore {
    namespace: String,
    blobs: Arc<BlobStore>,
    metadata: MetadataDb,
    snapshotter: Arc<dyn Snapshotter>,
    /// (layer digest, diff ID) pairs whose content matched during this run.
    verified: Mutex<HashSet<(String, String)>>,
}

impl LocalStore {
    /// Assembles the service from already-opened parts.
    pub fn new(
        namespace: &str,
        blobs: BlobStore,
        metadata: MetadataDb,
        snapshotter: Box<dyn Snapshotter>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            blobs: Arc::new(blobs),
            metadata,
            snapshotter: Arc::from(snapshotter),
            verified: Mutex::new(HashSet::new()),
        }
    }

    fn is_verified(&self, layer: &(String, String)) -> bool {
        self.verified.lock().map(|set| set.contains(layer)).unwrap_or(false)
    }

    fn mark_verified(&self, layer: (String, String)) {
        if let Ok(mut set) = self.verified.lock() {
            set.insert(layer);
        }
    }

    /// Commits every layer of `image` that is not yet unpacked.
    async fn unpack(&self, image: &PulledImage) -> Result<ChainId> {
        let chain = identity::chain_ids(&image.diff_ids)?;

        for (i, (layer, diff_id)) in image.layers.iter().zip(&image.diff_ids).enumerate() {
            let id = chain[i].clone();
            let pair = (layer.digest.clone(), diff_id.clone());
            let committed = self.snapshotter.is_committed(&id);
            if committed && self.is_verified(&pair) {
                debug!(chain_id = %id, "layer already unpacked");
                continue;
            }

            let parent = i.checked_sub(1).map(|p| chain[p].clone());
            let blobs = Arc::clone(&self.blobs);
            let snapshotter = Arc::clone(&self.snapshotter);
            let (digest, expected) = pair.clone();

            if committed {
                // The chain exists, but this image's blob still has to hash to
                // the diff ID it claims.
                debug!(chain_id = %id, layer = %digest, "verifying unpacked layer");
                run_blocking(move || {
                    let mut blob = blobs.open_blob(&digest)?;
                    let actual = unpack::diff_id_of(&mut blob, &digest)?;
                    unpack::check_diff_id(&digest, &expected, &actual)
                })
                .await?;
            } else {
                debug!(chain_id = %id, layer = %digest, "unpacking layer");
                run_blocking(move || {
                    let mut blob = blobs.open_blob(&digest)?;
                    let layer = LayerSource {
                        digest: &digest,
                        diff_id: &expected,
                        reader: &mut blob,
                    };
                    snapshotter.commit_layer(parent.as_ref(), &id, layer)
                })
                .await?;
            }
            self.mark_verified(pair);
        }

        chain
            .last()
            .cloned()
            .ok_or_else(|| crate::error::Error::InvalidImageConfig {
                reference: image.reference.clone(),
                reason: "image has no layers".to_string(),
            })
    }
}

#[async_trait]
impl ImageService for LocalStore {
    fn snapshotter(&self) -> &str {
        self.snapshotter.name()
    }

    async fn ensure_namespace(&self) -> Result<()> {
        if self.metadata.create_namespace(&self.namespace).await? {
            info!(namespace = %self.namespace, "created namespace");
        }
        Ok(())
    }

    async fn pull(&self, reference: &str, opts: &PullOptions) -> Result<ImageHandle> {
        let image = registry::pull_image(reference, &self.blobs, opts).await?;
        let chain_id = self.unpack(&image).await?;
        debug!(reference, chain_id = %chain_id, platform = %image.platform, "image unpacked");

        Ok(ImageHandle {
            reference: image.reference,
            digest: image.digest,
            diff_ids: image.diff_ids,
        })
    }

    async fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>> {
        let snapshotter = Arc::clone(&self.snapshotter);
        let (key, parent) = (key.to_string(), parent.clone());
        run_blocking(move || snapshotter.view(&key, &parent)).await
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let snapshotter = Arc::clone(&self.snapshotter);
        let key = key.to_string();
        run_blocking(move || snapshotter.mounts(&key)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let snapshotter = Arc::clone(&self.snapshotter);
        let key = key.to_string();
        run_blocking(move || snapshotter.remove(&key)).await
    }
}
