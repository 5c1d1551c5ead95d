use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

use crate::error::{PullError, Result};
use crate::metadata::{is_supported_layer, ImageConfig, LayerDescriptor};
use crate::progress::ProgressSender;

/// An image reference resolved to its config and ordered layer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    pub reference: String,
    pub manifest_digest: Option<String>,
    pub config: ImageConfig,
    pub layers: Vec<LayerDescriptor>,
}

/// How much a source trusts what the other side hands back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Check every blob against its descriptor digest.
    #[default]
    VerifyDigests,
    /// Skip digest checks and accept invalid TLS certificates.
    AcceptAnything,
}

impl TrustPolicy {
    pub fn verifies_digests(self) -> bool {
        self == TrustPolicy::VerifyDigests
    }
}

/// Where images come from: resolves references and hands out layer blobs.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Short label used in log records.
    fn name(&self) -> &str;

    /// Resolves a reference to its manifest, config and ordered layers.
    /// Fails with [`PullError::Resolution`] when the reference cannot be used.
    async fn resolve(&self, reference: &str) -> Result<ResolvedImage>;

    /// Retrieves one layer blob of a previously resolved image.
    ///
    /// The returned reader yields the compressed bytes exactly as stored. Sources
    /// spool or stream; they never hold a whole blob in memory.
    async fn fetch_blob(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>>;
}

/// Rejects images carrying a layer media type the unpacker cannot read.
pub(crate) fn check_layer_types(reference: &str, layers: &[LayerDescriptor]) -> Result<()> {
    match layers.iter().find(|l| !is_supported_layer(&l.media_type)) {
        Some(layer) => Err(PullError::resolution(
            reference,
            format!(
                "layer {} has unsupported media type {}",
                layer.digest, layer.media_type
            ),
        )),
        None => Ok(()),
    }
}

/// Compares a finished hash against a `sha256:<hex>` digest.
pub(crate) fn check_digest(expected: &str, hasher: Sha256) -> Result<()> {
    let Some(want) = expected.strip_prefix("sha256:") else {
        return Err(PullError::fetch(
            expected,
            "only sha256 digests can be verified",
        ));
    };
    let actual = hex::encode(hasher.finalize());
    if actual.eq_ignore_ascii_case(want) {
        Ok(())
    } else {
        Err(PullError::fetch(
            expected,
            format!("digest mismatch, content hashes to sha256:{}", actual),
        ))
    }
}
