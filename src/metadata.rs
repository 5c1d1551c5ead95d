use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

/// OCI gzip layer media type.
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// Docker schema 2 gzip layer media type.
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Returns true for the layer media types this crate can unpack.
pub fn is_supported_layer(media_type: &str) -> bool {
    media_type == OCI_LAYER_GZIP || media_type == DOCKER_LAYER_GZIP
}

/// One layer of a resolved image, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub digest: String,
    /// 0-based position; lower ordinals are applied first.
    pub ordinal: usize,
    /// Compressed size in bytes as advertised by the manifest.
    pub size: u64,
    pub media_type: String,
}

/// The subset of the image configuration carried through to reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub env: Vec<String>,
}

impl ImageConfig {
    /// Parses a raw image configuration blob.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        let config: ImageConfiguration = serde_json::from_slice(data)?;
        Ok(from_oci_config(&config))
    }
}

pub fn from_oci_config(config: &ImageConfiguration) -> ImageConfig {
    let env = config
        .config()
        .as_ref()
        .map(|c| c.env().clone().unwrap_or_default())
        .unwrap_or_default();

    ImageConfig {
        architecture: config.architecture().to_string(),
        os: config.os().to_string(),
        env,
    }
}

/// Builds ordered descriptors from `(digest, size, media_type)` triples in manifest order.
pub fn ordered_layers<I>(layers: I) -> Vec<LayerDescriptor>
where
    I: IntoIterator<Item = (String, u64, String)>,
{
    layers
        .into_iter()
        .enumerate()
        .map(|(ordinal, (digest, size, media_type))| LayerDescriptor {
            digest,
            ordinal,
            size,
            media_type,
        })
        .collect()
}
