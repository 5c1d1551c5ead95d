//! OCI image layout directories routed through `AnySource`.

use crate::integration::common::{count_entries, two_layer_image, write_layout};
use image_analyzer::error::PullError;
use image_analyzer::sources::RegistryOptions;
use image_analyzer::{
    AnalyzeOptions, AnySource, Cancellation, ImagePuller, PullerSettings, WorkspaceManager,
};
use tempfile::TempDir;

const CONFIG: &str = r#"{"architecture":"arm64","os":"linux","config":{"Env":["LANG=C.UTF-8"]},"rootfs":{"type":"layers","diff_ids":[]}}"#;

fn any_puller(root: &TempDir) -> ImagePuller<AnySource> {
    ImagePuller::new(
        AnySource::new(RegistryOptions::default()),
        WorkspaceManager::new(root.path()),
        PullerSettings::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_layout_reference_end_to_end() {
        let layout = TempDir::new().unwrap();
        write_layout(layout.path(), CONFIG, &two_layer_image());
        let root = TempDir::new().unwrap();
        let puller = any_puller(&root);

        let reference = format!("oci:{}", layout.path().display());
        let report = puller
            .analyze(&reference, &AnalyzeOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(report.architecture, "arm64");
        assert_eq!(report.env, vec!["LANG=C.UTF-8"]);
        assert!(report.os_info.contains("NAME=Test"));
        assert_eq!(report.python_packages, vec!["foo-1.0.dist-info"]);
        assert_eq!(report.tools.get("curl"), Some(&true));
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_layout_is_a_resolution_error() {
        let layout = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let puller = any_puller(&root);

        let reference = format!("oci:{}", layout.path().join("nope").display());
        let err = puller
            .pull_and_extract(&reference, &Cancellation::never())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PullError::Resolution { .. }));
        assert_eq!(count_entries(root.path()), 0);
    }
}
