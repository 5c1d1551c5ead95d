//! Applies an image's layers, in order, onto one shared root.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use crate::cancel::Cancellation;
use crate::error::{PullError, Result};
use crate::metadata::LayerDescriptor;
use crate::progress::ProgressSender;
use crate::tar_extractor::{unpack_layer, UnpackOptions, UnpackStats};

/// Hands out the compressed bytes of one layer.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(
        &self,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>>;
}

fn aborted(layer: &LayerDescriptor, err: PullError) -> PullError {
    match err {
        PullError::Cancelled(_) => err,
        other => PullError::ApplyAborted {
            ordinal: layer.ordinal,
            digest: layer.digest.clone(),
            source: Box::new(other),
        },
    }
}

/// Fetches and unpacks every layer in ascending ordinal order.
///
/// Layers are applied strictly one after another; the first failure stops the
/// run. The root is never removed here, even on failure.
pub async fn apply_layers(
    layers: &[LayerDescriptor],
    root: &Path,
    fetcher: &dyn BlobFetcher,
    progress: &ProgressSender,
    options: &UnpackOptions,
    cancel: &Cancellation,
) -> Result<UnpackStats> {
    let mut ordered: Vec<&LayerDescriptor> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.ordinal);

    let mut seen = HashSet::new();
    if let Some(dup) = ordered.iter().find(|layer| !seen.insert(layer.ordinal)) {
        return Err(aborted(
            dup,
            PullError::UnpackFormat(format!("duplicate layer ordinal {}", dup.ordinal)),
        ));
    }

    let mut total = UnpackStats::default();
    for (applied, layer) in ordered.into_iter().enumerate() {
        cancel.check()?;
        log::info!(
            "Applying layer {}/{} digest={} size={}",
            applied + 1,
            layers.len(),
            layer.digest,
            layer.size
        );

        let blob = tokio::select! {
            reason = cancel.cancelled() => return Err(PullError::Cancelled(reason)),
            blob = fetcher.fetch(layer, progress) => blob.map_err(|e| aborted(layer, e))?,
        };

        let root_owned = root.to_path_buf();
        let unpack_options = *options;
        let unpack_cancel = cancel.clone();
        let stats = tokio::task::spawn_blocking(move || {
            unpack_layer(blob, &root_owned, &unpack_options, &unpack_cancel)
        })
        .await
        .map_err(|e| aborted(layer, PullError::Task(e.to_string())))?
        .map_err(|e| aborted(layer, e))?;

        log::debug!(
            "Layer {} applied entries={} files={} whiteouts={} skipped={}",
            layer.ordinal,
            stats.entries,
            stats.files,
            stats.whiteouts,
            stats.skipped
        );
        total.merge(&stats);
    }

    Ok(total)
}
