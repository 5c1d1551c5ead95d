pub mod analyze;
pub mod cancel;
pub mod config;
pub mod error;
pub mod layers;
pub mod metadata;
pub mod progress;
pub mod puller;
pub mod report;
pub mod server;
pub mod sources;
pub mod tar_extractor;
pub mod workspace;

// Re-exports for easy access
pub use analyze::{analyze_root, AnalyzeOptions};
pub use cancel::{CancelSource, Cancellation};
pub use error::{PullError, Result};
pub use metadata::{ImageConfig, LayerDescriptor};
pub use puller::{ImagePuller, PulledImage, PullerSettings};
pub use report::{OutputFormat, Report};
pub use sources::{AnySource, ImageSource, LayoutSource, RegistrySource, ResolvedImage};
pub use tar_extractor::{unpack_layer, UnpackOptions, UnpackStats};
pub use workspace::{Workspace, WorkspaceManager};
