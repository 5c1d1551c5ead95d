//! Temporary workspaces that hold one materialized image each.
//!
//! A [`Workspace`] is created empty under the manager's root with a random,
//! unguessable suffix and is owned by exactly one pull. [`Workspace::destroy`]
//! consumes the guard, so the tree is retired at most once; a guard that is
//! dropped without being destroyed removes its tree synchronously as a last
//! resort.

use crate::error::{PullError, Result};
use log::{debug, error, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SUFFIX_BYTES: usize = 8;
const NAME_ATTEMPTS: usize = 3;

/// Bounded, capped exponential backoff for workspace removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of removal attempts, including the first one.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Allocates workspaces as siblings under a single root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    retry: RetryPolicy,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Workspaces under the system temp directory.
    pub fn system() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Creates an empty directory named `{prefix}-{suffix}` under the root.
    pub async fn create(&self, prefix: &str) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| PullError::WorkspaceCreate {
                root: self.root.clone(),
                source,
            })?;

        for _ in 0..NAME_ATTEMPTS {
            let path = self.root.join(format!("{}-{}", prefix, unique_suffix()));

            let mut builder = tokio::fs::DirBuilder::new();
            #[cfg(unix)]
            builder.mode(0o700);

            match builder.create(&path).await {
                Ok(()) => {
                    info!(
                        "Created workspace dir={} prefix={}",
                        path.display(),
                        prefix
                    );
                    return Ok(Workspace {
                        path,
                        retry: self.retry,
                        retired: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(
                        "Workspace name collision, drawing a new suffix dir={}",
                        path.display()
                    );
                }
                Err(source) => {
                    error!(
                        "Failed to create workspace root={} prefix={}: {}",
                        self.root.display(),
                        prefix,
                        source
                    );
                    return Err(PullError::WorkspaceCreate {
                        root: self.root.clone(),
                        source,
                    });
                }
            }
        }

        Err(PullError::WorkspaceCreate {
            root: self.root.clone(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "no unused workspace name after repeated attempts",
            ),
        })
    }

    /// Removes `path` with this manager's retry policy. See [`destroy_workspace`].
    pub async fn destroy(&self, path: &Path) -> Result<()> {
        destroy_workspace(path, &self.retry).await
    }
}

/// Exclusively owned working directory of one pull.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    retry: RetryPolicy,
    retired: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retires the workspace. Consumes the guard, so this happens at most once.
    pub async fn destroy(mut self) -> Result<()> {
        self.retired = true;
        destroy_workspace(&self.path, &self.retry).await
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.retired {
            return;
        }
        warn!(
            "Workspace dropped without destroy, removing synchronously dir={}",
            self.path.display()
        );
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(
                "Failed to remove dropped workspace dir={}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Recursively removes a workspace tree.
///
/// A path that does not exist is a no-op. Transient failures are retried per
/// `retry`; permission failures are returned immediately.
pub async fn destroy_workspace(path: &Path, retry: &RetryPolicy) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }

    let attempts = retry.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(
                    "Removed workspace dir={} attempt={}",
                    path.display(),
                    attempt
                );
                return Ok(());
            }
            Err(e) => e,
        };

        // A concurrent removal can report NotFound for a child; only a missing
        // root means the work is done.
        if err.kind() == io::ErrorKind::NotFound
            && !tokio::fs::try_exists(path).await.unwrap_or(true)
        {
            debug!("Workspace already removed dir={}", path.display());
            return Ok(());
        }

        if err.kind() == io::ErrorKind::PermissionDenied {
            error!(
                "Permission denied removing workspace dir={} attempt={}: {}",
                path.display(),
                attempt,
                err
            );
            return Err(PullError::WorkspaceCleanup {
                path: path.to_path_buf(),
                attempts: attempt,
                source: err,
            });
        }

        if attempt >= attempts {
            error!(
                "Giving up removing workspace dir={} attempts={}: {}",
                path.display(),
                attempt,
                err
            );
            return Err(PullError::WorkspaceCleanup {
                path: path.to_path_buf(),
                attempts: attempt,
                source: err,
            });
        }

        let delay = retry.delay_after(attempt);
        warn!(
            "Failed to remove workspace, retrying dir={} attempt={} next_delay_ms={}: {}",
            path.display(),
            attempt,
            delay.as_millis(),
            err
        );
        tokio::time::sleep(delay).await;
    }
}

fn unique_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
