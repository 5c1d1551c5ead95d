//! HTTP surface: `POST /analyze` and `GET /readiness`.
//!
//! Every analysis runs on its own spawned task, so a client hanging up cannot
//! abandon a pull halfway through its workspace cleanup.

use anyhow::{Context, Result};
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::analyze::AnalyzeOptions;
use crate::cancel::Cancellation;
use crate::puller::ImagePuller;
use crate::report::OutputFormat;
use crate::sources::{ImageSource, LayoutSource};

/// Shared, read-only state behind every request.
pub struct AppState<S: ImageSource> {
    pub puller: ImagePuller<S>,
    /// Used when a request carries no `options`.
    pub defaults: AnalyzeOptions,
    pub max_request_size: usize,
    /// Trips in-flight pulls when the server shuts down.
    pub cancel: Cancellation,
}

#[derive(Debug, Deserialize)]
struct AnalysisRequest {
    image_ref: String,
    #[serde(default)]
    options: Option<AnalyzeOptions>,
    #[serde(default)]
    format: Option<String>,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let body = json!({ "error": message.into() }).to_string();
    respond(status, "application/json", body)
}

/// Reads the whole body, refusing anything larger than `limit` bytes.
async fn read_body(body: &mut Body, limit: usize) -> std::result::Result<Vec<u8>, Response<Body>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e))
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", limit),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn declared_length(req: &Request<Body>) -> Option<usize> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn analyze<S: ImageSource + 'static>(
    state: Arc<AppState<S>>,
    mut req: Request<Body>,
) -> Response<Body> {
    if declared_length(&req).map_or(false, |len| len > state.max_request_size) {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", state.max_request_size),
        );
    }
    let body = match read_body(req.body_mut(), state.max_request_size).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request: AnalysisRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if request.image_ref.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "image_ref must not be empty");
    }
    if LayoutSource::handles(request.image_ref.trim()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "local image layouts cannot be analyzed over HTTP",
        );
    }
    let format: OutputFormat = match request.format.as_deref().unwrap_or("").parse() {
        Ok(format) => format,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let options = request.options.unwrap_or_else(|| state.defaults.clone());
    let image_ref = request.image_ref;

    log::info!("Analyzing image={} format={}", image_ref, format);
    let task_state = Arc::clone(&state);
    let task_ref = image_ref.clone();
    let outcome = tokio::spawn(async move {
        task_state
            .puller
            .analyze(&task_ref, &options, &task_state.cancel)
            .await
    })
    .await;

    let report = match outcome {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            log::error!("Analysis failed image={} error={}", image_ref, e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to extract image: {}", e.public_message()),
            );
        }
        Err(e) => {
            log::error!("Analysis task failed image={} error={}", image_ref, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "analysis task failed");
        }
    };

    match report.render(format) {
        Ok(body) => respond(StatusCode::OK, format.content_type(), body),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render report: {}", e),
        ),
    }
}

/// Routes one request. Never fails; every problem becomes a status code.
pub async fn handle<S: ImageSource + 'static>(
    state: Arc<AppState<S>>,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (path.as_str(), &method) {
        ("/analyze", &Method::POST) => analyze(state, req).await,
        ("/readiness", &Method::GET) => respond(
            StatusCode::OK,
            "application/json",
            json!({ "status": "ok" }).to_string(),
        ),
        ("/analyze", _) | ("/readiness", _) => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    log::info!("{} {} -> {}", method, path, response.status().as_u16());
    Ok(response)
}

/// Serves until `shutdown` resolves, then drains open connections.
pub async fn serve<S, F>(addr: SocketAddr, state: Arc<AppState<S>>, shutdown: F) -> Result<()>
where
    S: ImageSource + 'static,
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&state), req))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(make_svc);
    log::info!("Listening on http://{}", server.local_addr());

    server
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    log::info!("Server stopped");
    Ok(())
}
