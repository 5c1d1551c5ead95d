use async_trait::async_trait;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{ImageIndexEntry, OciDescriptor};
use oci_client::secrets::RegistryAuth as OciRegistryAuth;
use oci_client::{Client, Reference};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Seek, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::source::{check_digest, check_layer_types, ImageSource, ResolvedImage, TrustPolicy};
use crate::error::{PullError, Result};
use crate::metadata::{ordered_layers, ImageConfig, LayerDescriptor};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSender};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Everything the registry source needs, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub trust: TrustPolicy,
    /// Registries reached over plain HTTP.
    pub insecure_registries: Vec<String>,
    pub auth: RegistryAuth,
}

/// OCI registry implementation of [`ImageSource`].
pub struct RegistrySource {
    client: Client,
    auth: RegistryAuth,
    trust: TrustPolicy,
}

impl RegistrySource {
    pub fn new(options: RegistryOptions) -> Self {
        let protocol = if options.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(options.insecure_registries.clone())
        };
        let config = ClientConfig {
            protocol,
            accept_invalid_certificates: options.trust == TrustPolicy::AcceptAnything,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            auth: options.auth,
            trust: options.trust,
        }
    }

    fn parse_reference(reference: &str) -> Result<Reference> {
        reference
            .parse::<Reference>()
            .map_err(|e| PullError::resolution(reference, e))
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn name(&self) -> &str {
        "registry"
    }

    async fn resolve(&self, reference: &str) -> Result<ResolvedImage> {
        let image_ref = Self::parse_reference(reference)?;
        log::info!("Resolving image '{}' from {}", image_ref, image_ref.registry());

        let (manifest, manifest_digest, config_json) = self
            .client
            .pull_manifest_and_config(&image_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| PullError::resolution(reference, e))?;

        let config = ImageConfig::from_json(config_json.as_bytes())
            .map_err(|e| PullError::resolution(reference, format!("invalid image config: {}", e)))?;
        let layers = ordered_layers(manifest.layers.iter().map(|layer| {
            (
                layer.digest.clone(),
                u64::try_from(layer.size).unwrap_or(0),
                layer.media_type.clone(),
            )
        }));
        check_layer_types(reference, &layers)?;

        log::debug!(
            "Resolved image '{}' digest={} layers={}",
            reference,
            manifest_digest,
            layers.len()
        );
        Ok(ResolvedImage {
            reference: reference.to_string(),
            manifest_digest: Some(manifest_digest),
            config,
            layers,
        })
    }

    async fn fetch_blob(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>> {
        let image_ref = Self::parse_reference(&image.reference)?;
        let descriptor = OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: i64::try_from(layer.size).unwrap_or(i64::MAX),
            ..Default::default()
        };

        progress.send(ProgressEvent::new(ProgressKind::NewArtifact, &layer.digest));

        let spool = tempfile::tempfile().map_err(|e| PullError::fetch(&layer.digest, e))?;
        let mut writer = SpoolWriter {
            file: tokio::fs::File::from_std(spool),
            hasher: Sha256::new(),
            written: 0,
            total: Some(layer.size).filter(|size| *size > 0),
            digest: &layer.digest,
            progress,
        };

        self.client
            .pull_blob(&image_ref, &descriptor, &mut writer)
            .await
            .map_err(|e| PullError::fetch(&layer.digest, e))?;
        writer
            .flush()
            .await
            .map_err(|e| PullError::fetch(&layer.digest, e))?;

        let SpoolWriter {
            file,
            hasher,
            written,
            ..
        } = writer;
        if self.trust.verifies_digests() {
            check_digest(&layer.digest, hasher)?;
        }

        let mut file = file.into_std().await;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| PullError::fetch(&layer.digest, e))?;

        progress.send(
            ProgressEvent::new(ProgressKind::Done, &layer.digest).with_offset(written, Some(written)),
        );
        Ok(Box::new(file))
    }
}

/// Writes a downloading blob to its spool file, hashing and reporting as it goes.
struct SpoolWriter<'a> {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
    total: Option<u64>,
    digest: &'a str,
    progress: &'a ProgressSender,
}

impl AsyncWrite for SpoolWriter<'_> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                this.progress.send(
                    ProgressEvent::new(ProgressKind::Reading, this.digest)
                        .with_offset(this.written, this.total),
                );
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

/// Picks the linux manifest matching the host CPU out of a multi-platform index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
