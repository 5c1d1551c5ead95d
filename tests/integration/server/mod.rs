//! HTTP handler tests that run a real analysis.

use crate::integration::common::{
    count_entries, image_config, two_layer_image, write_layout, FakeSource,
};
use hyper::{Body, Method, Request, StatusCode};
use image_analyzer::server::{handle, AppState};
use image_analyzer::sources::RegistryOptions;
use image_analyzer::{
    AnalyzeOptions, AnySource, Cancellation, ImagePuller, PullerSettings, WorkspaceManager,
};
use std::sync::Arc;
use tempfile::TempDir;

fn state(root: &TempDir) -> Arc<AppState<FakeSource>> {
    let source = FakeSource::new().with_image("test:1", image_config("amd64"), two_layer_image());
    Arc::new(AppState {
        puller: ImagePuller::new(
            source,
            WorkspaceManager::new(root.path()),
            PullerSettings::default(),
        ),
        defaults: AnalyzeOptions::default(),
        max_request_size: 10 * 1024 * 1024,
        cancel: Cancellation::never(),
    })
}

fn any_state(root: &TempDir) -> Arc<AppState<AnySource>> {
    Arc::new(AppState {
        puller: ImagePuller::new(
            AnySource::new(RegistryOptions::default()),
            WorkspaceManager::new(root.path()),
            PullerSettings::default(),
        ),
        defaults: AnalyzeOptions::default(),
        max_request_size: 10 * 1024 * 1024,
        cancel: Cancellation::never(),
    })
}

fn post(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/analyze")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: hyper::Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_analyze_json_by_default() {
        let root = TempDir::new().unwrap();
        let response = handle(state(&root), post(r#"{"image_ref": "test:1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/json"
        );
        let report: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["architecture"], "amd64");
        assert_eq!(report["tools"]["curl"], true);
        assert_eq!(report["python_packages"][0], "foo-1.0.dist-info");
        assert_eq!(count_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_analyze_yaml_with_options() {
        let root = TempDir::new().unwrap();
        let body = r#"{
            "image_ref": "test:1",
            "format": "yaml",
            "options": {"check_common_tools": false, "specific_commands": ["curl"]}
        }"#;
        let response = handle(state(&root), post(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/x-yaml"
        );
        let report: serde_yaml::Value = serde_yaml::from_str(&body_text(response).await).unwrap();
        assert_eq!(report["os"], serde_yaml::Value::from("linux"));
        let tools = report["tools"].as_mapping().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(report["tools"]["curl"], serde_yaml::Value::from(true));
    }

    #[tokio::test]
    async fn test_unknown_image_is_a_server_error() {
        let root = TempDir::new().unwrap();
        let response = handle(state(&root), post(r#"{"image_ref": "missing:1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(error["error"]
            .as_str()
            .unwrap()
            .starts_with("failed to extract image:"));
    }

    #[tokio::test]
    async fn test_local_layout_reference_is_refused() {
        let layout = TempDir::new().unwrap();
        write_layout(
            layout.path(),
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#,
            &two_layer_image(),
        );
        let root = TempDir::new().unwrap();

        let body = format!(r#"{{"image_ref": "oci:{}"}}"#, layout.path().display());
        let response = handle(any_state(&root), post(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let text = body_text(response).await;
        assert!(!text.contains("NAME=Test"));
        assert!(!text.contains(&layout.path().display().to_string()));
        assert_eq!(count_entries(root.path()), 0);
    }
}
