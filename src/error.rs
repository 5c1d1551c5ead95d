//! Error taxonomy for the pull-and-extract pipeline.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why an in-flight pull stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled explicitly.
    Cancelled,
    /// The pull ran past its deadline.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PullError {
    /// Reference invalid, registry unreachable, or manifest/config unusable.
    #[error("failed to resolve image '{reference}': {message}")]
    Resolution { reference: String, message: String },

    #[error("failed to create workspace under {}: {source}", .root.display())]
    WorkspaceCreate {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove workspace {} after {attempts} attempt(s): {source}", .path.display())]
    WorkspaceCleanup {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Transport failure while retrieving a blob. Never retried here.
    #[error("failed to fetch blob {digest}: {message}")]
    Fetch { digest: String, message: String },

    /// The layer stream is not a readable gzip-compressed tar archive.
    #[error("malformed layer archive: {0}")]
    UnpackFormat(String),

    #[error("failed to write {}: {source}", .path.display())]
    UnpackIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An archive entry tried to leave the destination root.
    #[error("archive entry '{}' escapes the destination root", .entry.display())]
    UnsafePath { entry: PathBuf },

    #[error("layer {ordinal} ({digest}) failed: {source}")]
    ApplyAborted {
        ordinal: usize,
        digest: String,
        #[source]
        source: Box<PullError>,
    },

    #[error("pull {0}")]
    Cancelled(CancelReason),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PullError {
    pub fn resolution(reference: impl Into<String>, message: impl fmt::Display) -> Self {
        PullError::Resolution {
            reference: reference.into(),
            message: message.to_string(),
        }
    }

    pub fn fetch(digest: impl Into<String>, message: impl fmt::Display) -> Self {
        PullError::Fetch {
            digest: digest.into(),
            message: message.to_string(),
        }
    }

    /// Follows `ApplyAborted` wrappers down to the error that actually happened.
    pub fn root_cause(&self) -> &PullError {
        match self {
            PullError::ApplyAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), PullError::Cancelled(_))
    }

    /// Renders the error for remote callers, leaving out local filesystem paths.
    pub fn public_message(&self) -> String {
        match self {
            PullError::WorkspaceCreate { .. } => "failed to allocate a workspace".to_string(),
            PullError::WorkspaceCleanup { .. } => "failed to release a workspace".to_string(),
            PullError::UnpackIo { source, .. } => {
                format!("failed to write layer contents: {}", source.kind())
            }
            PullError::ApplyAborted {
                ordinal,
                digest,
                source,
            } => format!(
                "layer {} ({}) failed: {}",
                ordinal,
                digest,
                source.public_message()
            ),
            other => other.to_string(),
        }
    }

    /// Maps an I/O error raised while streaming an entry out of the archive.
    ///
    /// Decoder failures surface as data/eof errors; everything else is a local write failure.
    pub(crate) fn from_stream(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => PullError::UnpackFormat(err.to_string()),
            _ => PullError::UnpackIo { path, source: err },
        }
    }
}

pub type Result<T, E = PullError> = std::result::Result<T, E>;
