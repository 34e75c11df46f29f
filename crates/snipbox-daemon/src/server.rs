//! HTTP server

use crate::config::DaemonConfig;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use snipbox_core::protocol::{self, RunRequest, RunResponse, StatusReport};
use snipbox_core::{Coordinator, ResourceKind};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn router(coordinator: Arc<Coordinator>, config: &DaemonConfig) -> anyhow::Result<Router> {
    let mut app = Router::new()
        .route("/run", post(run))
        .route("/api/v1/run", post(run))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(config.body_limit()))
        .with_state(coordinator);

    if let Some(dir) = &config.static_dir {
        tracing::info!(static_dir = ?dir, "serving static assets");
        app = app.fallback_service(ServeDir::new(dir));
    }

    if let Some(origin) = &config.allowed_origin {
        let origin: HeaderValue = origin.parse()?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        );
    }

    Ok(app.layer(TraceLayer::new_for_http()))
}

/// Serve `app` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn run(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> (StatusCode, Json<RunResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::warn!("request body over limit");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(RunResponse::from_outcome(
                    &snipbox_core::ExecutionOutcome::rejected(ResourceKind::SourceTooLarge),
                    coordinator.policy(),
                )),
            );
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "malformed run request");
            return (StatusCode::BAD_REQUEST, Json(RunResponse::invalid_request()));
        }
    };

    let outcome = coordinator.execute_detached(request.code).await;
    let status = StatusCode::from_u16(protocol::status_code(&outcome))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(RunResponse::from_outcome(&outcome, coordinator.policy())))
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusReport> {
    Json(coordinator.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use snipbox_core::{IsolationConfig, SandboxConfig};
    use tower::ServiceExt;

    fn app(root: &std::path::Path, origin: Option<&str>) -> Router {
        let sandbox = SandboxConfig::builder()
            .interpreter("/bin/sh")
            .source_file_name("main.sh")
            .workspace_root(root)
            .max_source_bytes(64)
            .isolation(IsolationConfig {
                network: false,
                landlock: false,
                seccomp: false,
                ..IsolationConfig::default()
            })
            .build();
        let config = DaemonConfig {
            allowed_origin: origin.map(str::to_owned),
            sandbox: sandbox.clone(),
            ..DaemonConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(sandbox).unwrap());
        router(coordinator, &config).unwrap()
    }

    fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn run_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), None)
            .oneshot(post_json("/run", r#"{"code":"echo hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunResponse = read_json(response).await;
        assert_eq!(
            body,
            RunResponse {
                success: true,
                output: "hi\n".into(),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn versioned_route_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), None)
            .oneshot(post_json("/api/v1/run", r#"{"code":"exit 2"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: RunResponse = read_json(response).await;
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("process exited with code 2"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), None)
            .oneshot(post_json("/run", r#"{"source":"echo hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: RunResponse = read_json(response).await;
        assert_eq!(body, RunResponse::invalid_request());
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let code = "echo ".to_owned() + &"x".repeat(100);
        let body = serde_json::to_string(&RunRequest { code }).unwrap();
        let response = app(dir.path(), None)
            .oneshot(post_json("/run", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: RunResponse = read_json(response).await;
        assert_eq!(body.error.as_deref(), Some(ResourceKind::SourceTooLarge.description()));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let code = "x".repeat(4096);
        let body = serde_json::to_string(&RunRequest { code }).unwrap();
        let response = app(dir.path(), None)
            .oneshot(post_json("/run", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn health_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"ok");

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: StatusReport = read_json(response).await;
        assert_eq!(status.slots_total, 4);
        assert_eq!(status.slots_busy, 0);
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let dir = tempfile::tempdir().unwrap();
        let origin = "http://localhost:5173";
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/run")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app(dir.path(), Some(origin)).oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static(origin))
        );
    }
}
