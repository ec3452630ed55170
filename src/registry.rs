//! # OCI Registry Resolver
//!
//! Pulls images for the embedded image service: resolves the reference,
//! picks the manifest for the target platform, downloads the config and
//! every missing layer into the [`BlobStore`], and reports the layer diff
//! IDs needed to compute the image's chain ID.
//!
//! ## Security Model
//!
//! - References are validated against `MAX_IMAGE_REF_LEN` and a character
//!   allowlist before they reach the registry client.
//! - Layer count and size are bounded by `MAX_LAYERS` / `MAX_LAYER_SIZE`.
//! - Every network operation is bounded by `IMAGE_PULL_TIMEOUT`.
//! - Blob content is verified by [`BlobStore::put_blob`] before it is stored.
//!
//! ## Authentication
//!
//! Credentials come from the Docker client config (see
//! [`crate::credentials`]). Registries without an entry are pulled
//! anonymously. `plain_http` switches the transport to HTTP for every
//! registry, which is intended for local test registries.

use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE};
use crate::credentials::DockerConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::storage::BlobStore;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry access configuration shared by every pull of a run.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Use plain HTTP instead of HTTPS.
    pub plain_http: bool,
    /// Credentials source.
    pub credentials: Arc<DockerConfig>,
}

/// Options for a single pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Platform to resolve multi-arch images to.
    pub platform: Platform,
    /// Registry access configuration.
    pub resolver: ResolverConfig,
}

/// Metadata about an OCI image layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Compressed layer digest.
    pub digest: String,
    /// Layer size in bytes.
    pub size: u64,
    /// Media type.
    pub media_type: String,
}

/// Handle to a pulled image.
///
/// `layers` and `diff_ids` are ordered bottom-to-top and have equal length.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Original image reference.
    pub reference: String,
    /// Resolved manifest digest.
    pub digest: String,
    /// Platform the image was resolved for.
    pub platform: String,
    /// Compressed layers in order.
    pub layers: Vec<LayerInfo>,
    /// Uncompressed layer digests in order.
    pub diff_ids: Vec<String>,
}

/// The part of an image config this crate needs.
#[derive(Debug, Deserialize)]
struct ImageConfig {
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Validates an image reference before it is parsed.
pub fn validate_reference(image_ref: &str) -> Result<()> {
    if image_ref.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "empty reference".to_string(),
        });
    }

    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }

    if !image_ref
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }

    Ok(())
}

/// Parses a validated reference, applying Docker Hub defaults.
pub fn parse_reference(image_ref: &str) -> Result<Reference> {
    validate_reference(image_ref)?;
    image_ref.parse().map_err(|e| Error::InvalidImageReference {
        reference: image_ref.to_string(),
        reason: format!("{}", e),
    })
}

fn pull_failed(reference: impl ToString, reason: impl std::fmt::Display) -> Error {
    Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn client_for(resolver: &ResolverConfig) -> Client {
    let protocol = match resolver.plain_http {
        true => ClientProtocol::Http,
        false => ClientProtocol::Https,
    };
    Client::new(ClientConfig {
        protocol,
        ..Default::default()
    })
}

fn auth_for(resolver: &ResolverConfig, registry: &str) -> RegistryAuth {
    resolver
        .credentials
        .get(registry)
        .map_or(RegistryAuth::Anonymous, |creds| {
            debug!(registry, "using stored credentials");
            RegistryAuth::Basic(creds.username.clone(), creds.password.clone())
        })
}

/// Pulls `image_ref` for `opts.platform` into `storage`.
///
/// Layers already in the store are not fetched again. The returned layers
/// and diff IDs are checked to line up one to one.
pub async fn pull_image(image_ref: &str, storage: &BlobStore, opts: &PullOptions) -> Result<PulledImage> {
    let reference = parse_reference(image_ref)?;
    info!(platform = %opts.platform, "pulling image");

    let client = client_for(&opts.resolver);
    let auth = auth_for(&opts.resolver, reference.registry());

    let (top, digest) = with_timeout(format!("manifest of {}", image_ref), client.pull_manifest(&reference, &auth))
        .await?
        .map_err(|e| pull_failed(image_ref, e))?;

    let (layers, config) = resolve_manifest(&client, &reference, &auth, top, &opts.platform).await?;
    if layers.len() > MAX_LAYERS {
        return Err(pull_failed(
            image_ref,
            format!("{} layers exceeds the limit of {}", layers.len(), MAX_LAYERS),
        ));
    }

    let config_bytes = fetch_config(&client, &reference, &config, storage).await?;
    let diff_ids = parse_diff_ids(image_ref, &config_bytes)?;
    if diff_ids.len() != layers.len() {
        return Err(Error::InvalidImageConfig {
            reference: image_ref.to_string(),
            reason: format!("{} diff IDs for {} layers", diff_ids.len(), layers.len()),
        });
    }

    for layer in &layers {
        fetch_layer(&client, &reference, layer, storage).await?;
    }

    Ok(PulledImage {
        reference: image_ref.to_string(),
        digest,
        platform: opts.platform.to_string(),
        layers,
        diff_ids,
    })
}

/// Stores one compressed layer unless it is cached.
async fn fetch_layer(client: &Client, reference: &Reference, layer: &LayerInfo, storage: &BlobStore) -> Result<()> {
    if storage.has_blob(&layer.digest) {
        debug!(digest = %layer.digest, "layer cached");
        return Ok(());
    }
    if layer.size > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            size: layer.size,
            limit: MAX_LAYER_SIZE,
        });
    }

    debug!(digest = %layer.digest, size = layer.size, "fetching layer");
    let descriptor = OciDescriptor {
        media_type: layer.media_type.clone(),
        digest: layer.digest.clone(),
        size: layer.size as i64,
        urls: None,
        annotations: None,
    };

    let mut data = Vec::with_capacity(layer.size as usize);
    with_timeout(format!("layer {}", layer.digest), client.pull_blob(reference, &descriptor, &mut data))
        .await?
        .map_err(|e| Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: format!("download: {}", e),
        })?;

    storage.put_blob(&layer.digest, &data)
}

/// Runs a registry operation under `IMAGE_PULL_TIMEOUT`.
async fn with_timeout<T>(operation: String, fut: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Timeout {
            operation,
            duration: IMAGE_PULL_TIMEOUT,
        })
}

/// Downloads (or reads from cache) the image config blob.
async fn fetch_config(
    client: &Client,
    reference: &Reference,
    config: &OciDescriptor,
    storage: &BlobStore,
) -> Result<Vec<u8>> {
    if storage.has_blob(&config.digest) {
        return storage.get_blob(&config.digest);
    }

    if config.size < 0 || config.size as usize > MAX_MANIFEST_SIZE {
        return Err(Error::ImageTooLarge {
            size: config.size.max(0) as u64,
            limit: MAX_MANIFEST_SIZE as u64,
        });
    }

    let mut data = Vec::new();
    with_timeout(format!("pull config {}", config.digest), async {
        client.pull_blob(reference, config, &mut data).await
    })
    .await?
    .map_err(|e| pull_failed(reference.whole(), format!("config: {}", e)))?;

    storage.put_blob(&config.digest, &data)?;
    Ok(data)
}

/// Extracts `rootfs.diff_ids` from a raw image config.
pub fn parse_diff_ids(image_ref: &str, config: &[u8]) -> Result<Vec<String>> {
    let config: ImageConfig = serde_json::from_slice(config).map_err(|e| Error::InvalidImageConfig {
        reference: image_ref.to_string(),
        reason: e.to_string(),
    })?;

    if config.rootfs.diff_ids.is_empty() {
        return Err(Error::InvalidImageConfig {
            reference: image_ref.to_string(),
            reason: "image has no layers".to_string(),
        });
    }

    Ok(config.rootfs.diff_ids)
}

/// Picks the index entry for `platform`.
///
/// The error lists the platforms the index does offer to aid debugging.
pub fn select_platform_manifest<'a>(
    image_ref: &str,
    index: &'a OciImageIndex,
    platform: &Platform,
) -> Result<&'a ImageIndexEntry> {
    let matching = index.manifests.iter().find(|m| {
        m.platform.as_ref().is_some_and(|p| {
            platform.matches(&p.os, &p.architecture, p.variant.as_deref())
        })
    });

    matching.ok_or_else(|| {
        let available: Vec<String> = index
            .manifests
            .iter()
            .filter_map(|m| m.platform.as_ref())
            .map(|p| match &p.variant {
                Some(v) => format!("{}/{}/{}", p.os, p.architecture, v),
                None => format!("{}/{}", p.os, p.architecture),
            })
            .collect();

        Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: format!(
                "no manifest for {}. Available: {}",
                platform,
                available.join(", ")
            ),
        }
    })
}

/// Returns the layers and config of the image manifest for `platform`,
/// following one level of index.
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
    platform: &Platform,
) -> Result<(Vec<LayerInfo>, OciDescriptor)> {
    let image = match manifest {
        OciManifest::Image(image) => image,
        OciManifest::ImageIndex(index) => {
            let entry = select_platform_manifest(&reference.whole(), &index, platform)?;
            debug!(digest = %entry.digest, "selected platform manifest");

            let pinned = reference.clone_with_digest(entry.digest.clone());
            let (child, _) = with_timeout(format!("manifest {}", entry.digest), client.pull_manifest(&pinned, auth))
                .await?
                .map_err(|e| pull_failed(reference.whole(), e))?;

            match child {
                OciManifest::Image(image) => image,
                OciManifest::ImageIndex(_) => {
                    return Err(pull_failed(reference.whole(), "index points at another index"));
                }
            }
        }
    };

    Ok((image.layers.into_iter().map(layer_info).collect(), image.config))
}

fn layer_info(l: OciDescriptor) -> LayerInfo {
    LayerInfo {
        digest: l.digest,
        size: l.size.max(0) as u64,
        media_type: l.media_type,
    }
}
