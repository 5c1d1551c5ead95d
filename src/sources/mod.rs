pub mod layout;
pub mod registry;
pub mod source;

pub use layout::{LayoutSource, LAYOUT_PREFIX};
pub use registry::{RegistryAuth, RegistryOptions, RegistrySource};
pub use source::{ImageSource, ResolvedImage, TrustPolicy};

use async_trait::async_trait;
use std::io::Read;

use crate::error::Result;
use crate::metadata::LayerDescriptor;
use crate::progress::ProgressSender;

/// Routes `oci:<dir>` references to [`LayoutSource`] and everything else to
/// [`RegistrySource`].
pub struct AnySource {
    registry: RegistrySource,
    layout: LayoutSource,
}

impl AnySource {
    pub fn new(options: RegistryOptions) -> Self {
        let layout = LayoutSource::new(options.trust);
        Self {
            registry: RegistrySource::new(options),
            layout,
        }
    }

    fn route(&self, reference: &str) -> &dyn ImageSource {
        if LayoutSource::handles(reference) {
            &self.layout
        } else {
            &self.registry
        }
    }
}

#[async_trait]
impl ImageSource for AnySource {
    fn name(&self) -> &str {
        "any"
    }

    async fn resolve(&self, reference: &str) -> Result<ResolvedImage> {
        let source = self.route(reference);
        log::debug!("Resolving '{}' via {} source", reference, source.name());
        source.resolve(reference).await
    }

    async fn fetch_blob(
        &self,
        image: &ResolvedImage,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>> {
        self.route(&image.reference)
            .fetch_blob(image, layer, progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing() {
        let source = AnySource::new(RegistryOptions::default());
        assert_eq!(source.route("oci:/var/lib/images/app").name(), "oci-layout");
        assert_eq!(source.route("docker.io/library/alpine:3.19").name(), "registry");
        assert_eq!(source.route("alpine").name(), "registry");
    }
}
