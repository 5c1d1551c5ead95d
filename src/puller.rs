//! End-to-end "image reference → materialized root" pipeline.
//!
//! This module provides [`ImagePuller`], the one entry point shared by the CLI
//! and the HTTP server. For each call it:
//! - resolves the reference through a concrete [`ImageSource`],
//! - allocates a fresh [`Workspace`] for this call alone,
//! - fetches and unpacks every layer in order onto that workspace,
//! - and hands the finished root to the caller, or removes it before
//!   returning an error.
//!
//! Each call owns its own progress relay and cancel scope; nothing is shared
//! between concurrent pulls except the workspace root directory.

use async_trait::async_trait;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::analyze::{analyze_root, AnalyzeOptions};
use crate::cancel::{CancelScope, Cancellation};
use crate::error::{PullError, Result};
use crate::layers::{apply_layers, BlobFetcher};
use crate::metadata::LayerDescriptor;
use crate::progress::{ProgressRelay, ProgressSender, RelaySettings};
use crate::report::Report;
use crate::sources::{ImageSource, ResolvedImage};
use crate::tar_extractor::{UnpackOptions, UnpackStats};
use crate::workspace::{Workspace, WorkspaceManager};

const DEFAULT_PREFIX: &str = "layers";
/// Deadline applied to one pull unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-pull knobs, fixed when the puller is built.
#[derive(Clone)]
pub struct PullerSettings {
    /// Workspace directories are named `{prefix}-{random}`.
    pub workspace_prefix: String,
    /// Deadline for one whole pull; `None` waits forever.
    pub timeout: Option<Duration>,
    pub unpack: UnpackOptions,
    pub relay: RelaySettings,
}

impl Default for PullerSettings {
    fn default() -> Self {
        Self {
            workspace_prefix: DEFAULT_PREFIX.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            unpack: UnpackOptions::default(),
            relay: RelaySettings::default(),
        }
    }
}

/// A successfully materialized image.
///
/// The caller owns `workspace` and releases it with [`Workspace::destroy`].
pub struct PulledImage {
    pub workspace: Workspace,
    pub image: ResolvedImage,
    pub stats: UnpackStats,
}

impl PulledImage {
    pub fn root(&self) -> &Path {
        self.workspace.path()
    }
}

/// Binds a source to one resolved image so the orchestrator only sees layers.
struct SourceFetcher<'a, S> {
    source: &'a S,
    image: &'a ResolvedImage,
}

#[async_trait]
impl<S: ImageSource> BlobFetcher for SourceFetcher<'_, S> {
    async fn fetch(
        &self,
        layer: &LayerDescriptor,
        progress: &ProgressSender,
    ) -> Result<Box<dyn Read + Send>> {
        self.source.fetch_blob(self.image, layer, progress).await
    }
}

/// Pulls images from a concrete [`ImageSource`] into private workspaces.
///
/// ### Type parameters
/// - `S`: where images come from (see [`crate::sources`]).
///
/// ### Concurrency
/// `ImagePuller<S>` holds no per-pull state, so one instance can serve many
/// concurrent pulls. Each gets its own workspace, relay and cancel scope.
pub struct ImagePuller<S: ImageSource> {
    source: S,
    workspaces: WorkspaceManager,
    settings: PullerSettings,
}

impl<S: ImageSource> ImagePuller<S> {
    pub fn new(source: S, workspaces: WorkspaceManager, settings: PullerSettings) -> Self {
        Self {
            source,
            workspaces,
            settings,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Resolves `reference` and materializes its filesystem.
    ///
    /// This will:
    /// 1. **Resolve** the reference to its config and ordered layers.
    /// 2. **Allocate** a new workspace under the manager's root.
    /// 3. **Apply** every layer in ordinal order onto that workspace.
    ///
    /// `cancel`, and the configured timeout, are observed while resolving, at
    /// every blob fetch and between archive entries.
    ///
    /// # Errors
    /// Any failure after step 2 removes the workspace before the error is
    /// returned, so an `Err` never leaves a directory behind. If that removal
    /// fails too, the removal failure is only logged.
    ///
    /// ### Examples
    /// ```no_run
    /// use image_analyzer::cancel::Cancellation;
    /// use image_analyzer::puller::{ImagePuller, PullerSettings};
    /// use image_analyzer::sources::{AnySource, RegistryOptions};
    /// use image_analyzer::workspace::WorkspaceManager;
    ///
    /// # async fn run() -> image_analyzer::error::Result<()> {
    /// let puller = ImagePuller::new(
    ///     AnySource::new(RegistryOptions::default()),
    ///     WorkspaceManager::system(),
    ///     PullerSettings::default(),
    /// );
    /// let pulled = puller.pull_and_extract("alpine:3.20", &Cancellation::never()).await?;
    /// println!("root at {}", pulled.root().display());
    /// pulled.workspace.destroy().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pull_and_extract(
        &self,
        reference: &str,
        cancel: &Cancellation,
    ) -> Result<PulledImage> {
        let relay = ProgressRelay::spawn(reference, self.settings.relay.clone());
        let result = self.pull(reference, cancel, relay.sender()).await;
        let relay_stats = relay.finish().await;

        log::debug!(
            "Pull finished image={} ok={} events={} dropped={}",
            reference,
            result.is_ok(),
            relay_stats.received,
            relay_stats.dropped
        );
        result
    }

    async fn pull(
        &self,
        reference: &str,
        cancel: &Cancellation,
        progress: &ProgressSender,
    ) -> Result<PulledImage> {
        let scope = CancelScope::new(cancel, self.settings.timeout);
        let token = scope.token();

        let image = tokio::select! {
            reason = token.cancelled() => return Err(PullError::Cancelled(reason)),
            image = self.source.resolve(reference) => image?,
        };
        token.check()?;

        let workspace = self
            .workspaces
            .create(&self.settings.workspace_prefix)
            .await?;
        let fetcher = SourceFetcher {
            source: &self.source,
            image: &image,
        };

        let applied = apply_layers(
            &image.layers,
            workspace.path(),
            &fetcher,
            progress,
            &self.settings.unpack,
            &token,
        )
        .await;

        match applied {
            Ok(stats) => {
                log::info!(
                    "Materialized image={} layers={} files={} bytes={} dir={}",
                    reference,
                    image.layers.len(),
                    stats.files,
                    stats.bytes,
                    workspace.path().display()
                );
                Ok(PulledImage {
                    workspace,
                    image,
                    stats,
                })
            }
            Err(err) => {
                let dir = workspace.path().to_path_buf();
                if let Err(cleanup) = workspace.destroy().await {
                    log::warn!(
                        "Failed to remove workspace after failed pull dir={} error={}",
                        dir.display(),
                        cleanup
                    );
                }
                Err(err)
            }
        }
    }

    /// Pulls, inspects and releases an image in one go.
    ///
    /// A failure to remove the workspace after a successful analysis is
    /// logged and the report is still returned.
    pub async fn analyze(
        &self,
        reference: &str,
        options: &AnalyzeOptions,
        cancel: &Cancellation,
    ) -> Result<Report> {
        let pulled = self.pull_and_extract(reference, cancel).await?;

        let root = pulled.root().to_path_buf();
        let config = pulled.image.config.clone();
        let options = options.clone();
        let analysis =
            tokio::task::spawn_blocking(move || analyze_root(&root, &config, &options)).await;

        let dir = pulled.root().to_path_buf();
        if let Err(cleanup) = pulled.workspace.destroy().await {
            log::warn!(
                "Failed to remove workspace dir={} error={}",
                dir.display(),
                cleanup
            );
        }

        analysis.map_err(|e| PullError::Task(e.to_string()))
    }
}
