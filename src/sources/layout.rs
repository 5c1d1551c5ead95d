use async_trait::async_trait;
use oci_spec::image::{ImageIndex, ImageManifest, MediaType};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::source::{check_digest, check_layer_types, ImageSource, ResolvedImage, TrustPolicy};
use crate::error::{PullError, Result};
use crate::metadata::{ordered_layers, ImageConfig, LayerDescriptor};
use crate::progress::{ProgressEvent, ProgressKind, ProgressSender};

/// Reference prefix naming an on-disk OCI image layout.
pub const LAYOUT_PREFIX: &str = "oci:";

/// Reads images from an OCI image layout directory (`oci:<dir>`).
///
/// The first manifest listed in `index.json` is used.
#[derive(Debug, Clone, Default)]
pub struct LayoutSource {
    trust: TrustPolicy,
}

impl LayoutSource {
    pub fn new(trust: TrustPolicy) -> Self {
        Self { trust }
    }

    pub fn handles(reference: &str) -> bool {
        reference.starts_with(LAYOUT_PREFIX)
    }

    fn layout_dir(reference: &str) -> Result<PathBuf> {
        match reference.strip_prefix(LAYOUT_PREFIX) {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => Err(PullError::resolution(
                reference,
                "expected oci:<layout directory>",
            )),
        }
    }

    async fn read_verified(&self, dir: &Path, digest: &str) -> Result<Vec<u8>> {
        let path = blob_path(dir, digest)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| PullError::fetch(digest, e))?;
        if self.trust.verifies_digests() {
            let mut hasher = Sha256::new();
            hasher.update(&data);
            check_digest(digest, hasher)?;
        }
        Ok(data)
    }

    async fn read_json<T: DeserializeOwned>(&self, dir: &Path, digest: &str) -> Result<T> {
        let data = self.read_verified(dir, digest).await?;
        serde_json::from_slice(&data).map_err(|e| PullError::fetch(digest, e))
    }
}

/// Maps `<alg>:<hex>` to `blobs/<alg>/<hex>`, refusing anything that is not a plain digest.
fn blob_path(dir: &Path, digest: &str) -> Result<PathBuf> {
    let (alg, hex) = digest
        .split_once(':')
        .ok_or_else(|| PullError::fetch(digest, "malformed digest"))?;
    let valid = !alg.is_empty()
        && !hex.is_empty()
        && alg.chars().all(|c| c.is_ascii_alphanumeric())
        && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(PullError::fetch(digest, "malformed digest"));
    }
    Ok(dir.join("blobs").join(alg).join(hex))
}

fn open_blob(path: &Path, digest: &str, verify: bool) -> Result<File> {
    let mut file = File::open(path).map_err(|e| PullError::fetch(digest, e))?;
    if verify {
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(|e| PullError::fetch(digest, e))?;
        check_digest(digest, hasher)?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| PullError::fetch(digest, e))?;
    }
    Ok(file)
}

#[async_trait]
impl ImageSource for LayoutSource {
    fn name(&self) -> &str {
        "oci-layout"
    }

    async fn resolve(&self, reference: &str) -> Result<ResolvedImage> {
        let dir = Self::layout_dir(reference)?;
        let marker = dir.join("oci-layout");
        if !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Err(PullError::resolution(
                reference,
                format!("{} is not an OCI image layout", dir.display()),
            ));
        }

        let index_bytes = tokio::fs::read(dir.join("index.json"))
            .await
            .map_err(|e| PullError::resolution(reference, format!("index.json: {}", e)))?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| PullError::resolution(reference, format!("index.json: {}", e)))?;

        let entry = index
            .manifests()
            .first()
            .ok_or_else(|| PullError::resolution(reference, "index.json lists no manifests"))?;
        if entry.media_type() != &MediaType::ImageManifest {
            return Err(PullError::resolution(
                reference,
                format!("unsupported manifest type {}", entry.media_type()),
            ));
        }
        let manifest_digest = entry.digest().to_string();

        let manifest: ImageManifest = self
            .read_json(&dir, &manifest_digest)
            .await
            .map_err(|e| PullError::resolution(reference, e))?;
        let config_digest = manifest.config().digest().to_string();
        let config_bytes = self
            .read_verified(&dir, &config_digest)
            .await
            .map_err(|e| PullError::resolution(reference, e))?;
        let config = ImageConfig::from_json(&config_bytes)
            .map_err(|e| PullError::resolution(reference, format!("invalid image config: {}", e)))?;

        let layers = ordered_layers(manifest.layers().iter().map(|layer| {
            (
                layer.digest().to_string(),
                layer.size() as u64,
                layer.media_type().to_string(),
            )
        }));
        check_layer_types(reference, &layers)?;

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
        let dir = Self::layout_dir(&image.reference)
            .map_err(|e| PullError::fetch(&layer.digest, e))?;
        let path = blob_path(&dir, &layer.digest)?;

        let kind = if layer.size == 0 {
            ProgressKind::Skipped
        } else {
            ProgressKind::NewArtifact
        };
        progress.send(ProgressEvent::new(kind, &layer.digest));

        let verify = self.trust.verifies_digests();
        let digest = layer.digest.clone();
        let file = tokio::task::spawn_blocking(move || open_blob(&path, &digest, verify))
            .await
            .map_err(|e| PullError::Task(e.to_string()))??;

        progress.send(
            ProgressEvent::new(ProgressKind::Done, &layer.digest)
                .with_offset(layer.size, Some(layer.size)),
        );
        Ok(Box::new(file))
    }
}
