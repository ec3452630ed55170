//! Remote image service backed by a containerd daemon.
//!
//! Talks to containerd over its gRPC socket. Pulls go through the Transfer
//! service with unpacking for the requested platform; diff IDs are then read
//! back from the Content service. Snapshots use the daemon's default
//! snapshotter. Every request carries the `containerd-namespace` header.

use crate::constants::{DEFAULT_REMOTE_SNAPSHOTTER, IMAGE_PULL_TIMEOUT, MAX_MANIFEST_SIZE, NAMESPACE_HEADER};
use crate::error::{Error, Result};
use crate::identity::ChainId;
use crate::mount::Mount;
use crate::registry::{self, PullOptions};
use crate::service::{ImageHandle, ImageService};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::namespaces_client::NamespacesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{MountsRequest, RemoveSnapshotRequest, ViewSnapshotRequest};
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    CreateNamespaceRequest, GetImageRequest, Namespace, ReadContentRequest, TransferOptions, TransferRequest,
};
use containerd_client::to_any;
use containerd_client::types::transfer::{ImageStore, OciRegistry, RegistryResolver, UnpackConfiguration};
use containerd_client::types::{Mount as ProtoMount, Platform as ProtoPlatform};
use oci_distribution::manifest::{OciImageIndex, OciImageManifest};
use std::collections::HashMap;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{debug, info};

const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Image service that delegates to containerd.
pub struct RemoteStore {
    namespace: String,
    namespace_header: AsciiMetadataValue,
    channel: Channel,
}

impl RemoteStore {
    /// Connects to the containerd socket at `address`.
    pub async fn connect(address: &str, namespace: &str) -> Result<Self> {
        let namespace_header: AsciiMetadataValue = namespace
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid namespace '{}'", namespace)))?;

        let channel = containerd_client::connect(address)
            .await
            .map_err(|e| Error::RemoteUnavailable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        debug!(address, namespace, "connected to containerd");
        Ok(Self {
            namespace: namespace.to_string(),
            namespace_header,
            channel,
        })
    }

    /// Wraps `message` in a request scoped to our namespace.
    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace_header.clone());
        request
    }

    /// Reads a whole blob from the content store.
    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel.clone());
        let mut stream = client
            .read(self.request(ReadContentRequest {
                digest: digest.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(|s| remote_err("content read", s))?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(|s| remote_err("content read", s))? {
            data.extend_from_slice(&chunk.data);
            if data.len() > MAX_MANIFEST_SIZE {
                return Err(Error::ImageTooLarge {
                    size: data.len() as u64,
                    limit: MAX_MANIFEST_SIZE as u64,
                });
            }
        }
        Ok(data)
    }

    /// Resolves the image target down to its config and returns the diff IDs.
    async fn diff_ids(&self, reference: &str, opts: &PullOptions) -> Result<(String, Vec<String>)> {
        let mut images = ImagesClient::new(self.channel.clone());
        let image = images
            .get(self.request(GetImageRequest {
                name: reference.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(|s| remote_err("image get", s))?
            .into_inner()
            .image
            .ok_or_else(|| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: "image not recorded after pull".to_string(),
            })?;

        let target = image.target.ok_or_else(|| Error::InvalidImageConfig {
            reference: reference.to_string(),
            reason: "image has no target".to_string(),
        })?;

        let mut manifest_digest = target.digest.clone();
        if INDEX_MEDIA_TYPES.contains(&target.media_type.as_str()) {
            let index: OciImageIndex = serde_json::from_slice(&self.read_blob(&target.digest).await?)?;
            let entry = registry::select_platform_manifest(reference, &index, &opts.platform)?;
            manifest_digest = entry.digest.clone();
        }

        let manifest: OciImageManifest = serde_json::from_slice(&self.read_blob(&manifest_digest).await?)?;
        let config = self.read_blob(&manifest.config.digest).await?;
        let diff_ids = registry::parse_diff_ids(reference, &config)?;

        Ok((target.digest, diff_ids))
    }
}

/// Maps a gRPC status to the crate error, keeping `AlreadyExists` and
/// `NotFound` distinguishable for snapshot calls.
fn snapshot_err(key: &str, status: Status) -> Error {
    match status.code() {
        Code::AlreadyExists => Error::SnapshotAlreadyExists { key: key.to_string() },
        Code::NotFound => Error::SnapshotNotFound { key: key.to_string() },
        _ => Error::SnapshotFailed {
            key: key.to_string(),
            reason: status.message().to_string(),
        },
    }
}

fn remote_err(operation: &str, status: Status) -> Error {
    Error::Remote {
        operation: operation.to_string(),
        reason: format!("{:?}: {}", status.code(), status.message()),
    }
}

fn convert_mounts(mounts: Vec<ProtoMount>) -> Vec<Mount> {
    mounts
        .into_iter()
        .map(|m| Mount {
            kind: m.r#type,
            source: m.source,
            options: m.options,
        })
        .collect()
}

#[async_trait]
impl ImageService for RemoteStore {
    fn snapshotter(&self) -> &str {
        ""
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let mut client = NamespacesClient::new(self.channel.clone());
        let request = Request::new(CreateNamespaceRequest {
            namespace: Some(Namespace {
                name: self.namespace.clone(),
                ..Default::default()
            }),
        });

        match client.create(request).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "created namespace");
                Ok(())
            }
            Err(status) if status.code() == Code::AlreadyExists => Ok(()),
            Err(status) => Err(remote_err("namespace create", status)),
        }
    }

    async fn pull(&self, reference: &str, opts: &PullOptions) -> Result<ImageHandle> {
        let parsed = registry::parse_reference(reference)?;
        let name = parsed.whole();

        let mut headers = HashMap::new();
        if let Some(creds) = opts.resolver.credentials.get(parsed.registry()) {
            let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
            headers.insert("Authorization".to_string(), format!("Basic {}", token));
        }

        let resolver = RegistryResolver {
            headers,
            default_scheme: if opts.resolver.plain_http { "http" } else { "https" }.to_string(),
            ..Default::default()
        };
        let platform = ProtoPlatform {
            os: opts.platform.os.clone(),
            architecture: opts.platform.architecture.clone(),
            variant: opts.platform.variant.clone().unwrap_or_default(),
            ..Default::default()
        };

        let source = OciRegistry {
            reference: name.clone(),
            resolver: Some(resolver),
            ..Default::default()
        };
        let destination = ImageStore {
            name: name.clone(),
            platforms: vec![platform.clone()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: DEFAULT_REMOTE_SNAPSHOTTER.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let request = self.request(TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: Some(TransferOptions::default()),
            ..Default::default()
        });

        debug!(reference, "pulling through containerd transfer service");
        let mut transfer = TransferClient::new(self.channel.clone());
        tokio::time::timeout(IMAGE_PULL_TIMEOUT, transfer.transfer(request))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("pull {}", reference),
                duration: IMAGE_PULL_TIMEOUT,
            })?
            .map_err(|s| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: s.message().to_string(),
            })?;

        let (digest, diff_ids) = self.diff_ids(&name, opts).await?;
        Ok(ImageHandle {
            reference: reference.to_string(),
            digest,
            diff_ids,
        })
    }

    async fn view(&self, key: &str, parent: &ChainId) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let response = client
            .view(self.request(ViewSnapshotRequest {
                snapshotter: DEFAULT_REMOTE_SNAPSHOTTER.to_string(),
                key: key.to_string(),
                parent: parent.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(|s| snapshot_err(key, s))?;
        Ok(convert_mounts(response.into_inner().mounts))
    }

    async fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let response = client
            .mounts(self.request(MountsRequest {
                snapshotter: DEFAULT_REMOTE_SNAPSHOTTER.to_string(),
                key: key.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(|s| snapshot_err(key, s))?;
        Ok(convert_mounts(response.into_inner().mounts))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        client
            .remove(self.request(RemoveSnapshotRequest {
                snapshotter: DEFAULT_REMOTE_SNAPSHOTTER.to_string(),
                key: key.to_string(),
                ..Default::default()
            }))
            .await
            .map_err(|s| snapshot_err(key, s))?;
        Ok(())
    }
}
