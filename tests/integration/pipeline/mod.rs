//! End-to-end pull, unpack and analysis against an in-memory source.

use crate::integration::common::{
    count_entries, gz_layer, image_config, two_layer_image, Entry, FakeSource,
};
use image_analyzer::error::{CancelReason, PullError};
use image_analyzer::{
    AnalyzeOptions, CancelSource, Cancellation, ImagePuller, PullerSettings, WorkspaceManager,
};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn puller(source: FakeSource, root: &TempDir) -> ImagePuller<FakeSource> {
    ImagePuller::new(
        source,
        WorkspaceManager::new(root.path()),
        PullerSettings::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_layer_analysis() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new().with_image("test:1", image_config("amd64"), two_layer_image());
        let puller = puller(source, &root);

        let options = AnalyzeOptions {
            specific_commands: vec!["curl".to_string()],
            ..AnalyzeOptions::default()
        };
        let report = puller
            .analyze("test:1", &options, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(report.architecture, "amd64");
        assert_eq!(report.os, "linux");
        assert_eq!(report.env, vec!["PATH=/usr/local/bin:/usr/bin"]);
        assert!(report.os_info.contains("NAME=Test"));
        assert_eq!(report.python_packages, vec!["foo-1.0.dist-info"]);
        assert_eq!(report.tools.get("curl"), Some(&true));
        assert_eq!(report.tools.get("sshd"), Some(&false));

        // The workspace is gone once the report exists.
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_pull_and_extract_hands_over_workspace() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new().with_image("test:1", image_config("arm64"), two_layer_image());
        let puller = puller(source, &root);

        let pulled = puller
            .pull_and_extract("test:1", &Cancellation::never())
            .await
            .unwrap();
        let dir = pulled.root().to_path_buf();

        assert!(dir.starts_with(root.path()));
        assert_eq!(
            fs::read_to_string(dir.join("etc/os-release")).unwrap(),
            "NAME=Test\n"
        );
        assert!(dir.join("usr/bin/curl").is_file());
        assert_eq!(pulled.image.layers.len(), 2);
        assert_eq!(pulled.stats.files, 2);

        pulled.workspace.destroy().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_unknown_reference_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let puller = puller(FakeSource::new(), &root);

        let err = puller
            .pull_and_extract("missing:latest", &Cancellation::never())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PullError::Resolution { .. }));
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_corrupt_layer_aborts_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let mut corrupt = vec![0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0x03];
        corrupt.extend(std::iter::repeat(0xff).take(64));
        let layers = vec![gz_layer(&[Entry::File("a.txt", "a")]), corrupt];
        let source = FakeSource::new().with_image("broken:1", image_config("amd64"), layers);
        let puller = puller(source, &root);

        let err = puller
            .pull_and_extract("broken:1", &Cancellation::never())
            .await
            .err()
            .unwrap();

        match &err {
            PullError::ApplyAborted { ordinal, .. } => assert_eq!(*ordinal, 1),
            other => panic!("unexpected error: {}", other),
        }
        assert!(matches!(err.root_cause(), PullError::UnpackFormat(_)));
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_later_layer_wins() {
        let root = TempDir::new().unwrap();
        let layers = vec![
            gz_layer(&[Entry::File("etc/motd", "first"), Entry::File("keep", "k")]),
            gz_layer(&[Entry::File("etc/motd", "second")]),
        ];
        let source = FakeSource::new().with_image("overlay:1", image_config("amd64"), layers);
        let puller = puller(source, &root);

        let pulled = puller
            .pull_and_extract("overlay:1", &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(pulled.root().join("etc/motd")).unwrap(),
            "second"
        );
        assert_eq!(fs::read_to_string(pulled.root().join("keep")).unwrap(), "k");
        pulled.workspace.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_whiteout_hides_lower_tool() {
        let root = TempDir::new().unwrap();
        let layers = vec![
            gz_layer(&[
                Entry::File("usr/bin/wget", ""),
                Entry::File("usr/bin/curl", ""),
            ]),
            gz_layer(&[Entry::File("usr/bin/.wh.wget", "")]),
        ];
        let source = FakeSource::new().with_image("slim:1", image_config("amd64"), layers);
        let puller = puller(source, &root);

        let report = puller
            .analyze("slim:1", &AnalyzeOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(report.tools.get("wget"), Some(&false));
        assert_eq!(report.tools.get("curl"), Some(&true));
    }

    #[tokio::test]
    async fn test_traversal_in_later_layer_is_rejected() {
        let root = TempDir::new().unwrap();
        let outside = root.path().join("escaped");
        let layers = vec![
            gz_layer(&[Entry::File("ok.txt", "ok")]),
            gz_layer(&[Entry::RawFile("../escaped", "evil")]),
        ];
        let source = FakeSource::new().with_image("evil:1", image_config("amd64"), layers);
        let puller = puller(source, &root);

        let err = puller
            .pull_and_extract("evil:1", &Cancellation::never())
            .await
            .err()
            .unwrap();

        assert!(matches!(err.root_cause(), PullError::UnsafePath { .. }));
        assert!(!outside.exists());
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_fetch() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new()
            .with_image("slow:1", image_config("amd64"), two_layer_image())
            .with_fetch_delay(Duration::from_secs(30));
        let settings = PullerSettings {
            timeout: Some(Duration::from_millis(50)),
            ..PullerSettings::default()
        };
        let puller = ImagePuller::new(source, WorkspaceManager::new(root.path()), settings);

        let err = puller
            .pull_and_extract("slow:1", &Cancellation::never())
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            PullError::Cancelled(CancelReason::DeadlineExceeded)
        ));
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new()
            .with_image("slow:1", image_config("amd64"), two_layer_image())
            .with_fetch_delay(Duration::from_secs(30));
        let puller = puller(source, &root);
        let cancel = CancelSource::new();
        let token = cancel.token();

        let trigger = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(puller.pull_and_extract("slow:1", &token), trigger);

        let err = outcome.err().unwrap();
        assert!(matches!(err, PullError::Cancelled(CancelReason::Cancelled)));
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pulls_use_distinct_workspaces() {
        let root = TempDir::new().unwrap();
        let source = FakeSource::new().with_image("test:1", image_config("amd64"), two_layer_image());
        let puller = Arc::new(puller(source, &root));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let puller = Arc::clone(&puller);
                tokio::spawn(async move {
                    puller
                        .pull_and_extract("test:1", &Cancellation::never())
                        .await
                })
            })
            .collect();

        let mut pulled = Vec::new();
        for handle in handles {
            pulled.push(handle.await.unwrap().unwrap());
        }

        let paths: HashSet<_> = pulled.iter().map(|p| p.root().to_path_buf()).collect();
        assert_eq!(paths.len(), 8);
        for image in &pulled {
            assert!(image.root().join("etc/os-release").is_file());
        }
        for image in pulled {
            image.workspace.destroy().await.unwrap();
        }
        assert_eq!(count_entries(root.path()), 0);
    }
}
