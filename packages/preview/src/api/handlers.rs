use crate::{
    orchestrator::SandboxOrchestrator,
    types::{
        ApiResponse, Capabilities, SandboxError, SandboxInfo, SandboxLogsRequest,
        SandboxLogsResponse, SandboxStatusResponse, StartSandboxRequest, StartSandboxResponse,
    },
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::Json,
};
use tracing::{error, info, warn};

/// Shared application state
pub type AppState = SandboxOrchestrator;

fn not_found<T>(sandbox_id: &str) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("Sandbox '{}' not found", sandbox_id))),
    )
}

fn start_error_status(error: &SandboxError) -> StatusCode {
    match error {
        SandboxError::InvalidSandboxId { .. } | SandboxError::InvalidFilePath { .. } => {
            StatusCode::BAD_REQUEST
        }
        SandboxError::CapacityExceeded { .. } | SandboxError::NoPortsAvailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SandboxError::Cancelled { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Materialize, install, run and wait for a sandbox
pub async fn start_sandbox(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
    request: Result<Json<StartSandboxRequest>, JsonRejection>,
) -> (StatusCode, Json<StartSandboxResponse>) {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            warn!("Rejected start request for sandbox {}: {}", sandbox_id, rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(StartSandboxResponse::rejected(format!(
                    "Invalid request body: {}",
                    rejection.body_text()
                ))),
            );
        }
    };

    info!(
        "Starting sandbox {} with {} files",
        sandbox_id,
        request.files.len()
    );

    match orchestrator
        .start(&sandbox_id, request.files, &request.title)
        .await
    {
        Ok(sandbox) => {
            info!("Sandbox {} is running at {}", sandbox_id, sandbox.url);
            (StatusCode::OK, Json(StartSandboxResponse::started(&sandbox)))
        }
        Err(e) => {
            error!("Failed to start sandbox {}: {}", sandbox_id, e);
            (start_error_status(&e), Json(StartSandboxResponse::failed(&e)))
        }
    }
}

/// Stop a sandbox; `data` is whether one was running
pub async fn stop_sandbox(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
) -> Json<ApiResponse<bool>> {
    info!("Stopping sandbox {}", sandbox_id);
    Json(ApiResponse::success(orchestrator.stop(&sandbox_id).await))
}

/// Get sandbox status. Polling status counts as activity.
pub async fn get_sandbox_status(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
) -> (StatusCode, Json<ApiResponse<SandboxStatusResponse>>) {
    orchestrator.touch(&sandbox_id).await;

    match orchestrator.status(&sandbox_id).await {
        Some(sandbox) => (
            StatusCode::OK,
            Json(ApiResponse::success(SandboxStatusResponse::from(&sandbox))),
        ),
        None => not_found(&sandbox_id),
    }
}

/// Get sandbox logs. Tailing logs counts as activity.
pub async fn get_sandbox_logs(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
    query: Result<Query<SandboxLogsRequest>, QueryRejection>,
) -> (StatusCode, Json<ApiResponse<SandboxLogsResponse>>) {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!(
                    "Invalid query: {}",
                    rejection.body_text()
                ))),
            );
        }
    };

    orchestrator.touch(&sandbox_id).await;

    match orchestrator
        .logs(&sandbox_id, query.since, query.limit)
        .await
    {
        Some(logs) => (StatusCode::OK, Json(ApiResponse::success(logs))),
        None => not_found(&sandbox_id),
    }
}

/// Clear sandbox logs
pub async fn clear_sandbox_logs(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    if orchestrator.clear_logs(&sandbox_id).await {
        info!("Cleared logs for sandbox {}", sandbox_id);
        (StatusCode::OK, Json(ApiResponse::success(())))
    } else {
        not_found(&sandbox_id)
    }
}

/// Refresh a sandbox's activity timestamp
pub async fn touch_sandbox(
    Path(sandbox_id): Path<String>,
    State(orchestrator): State<AppState>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    if orchestrator.touch(&sandbox_id).await {
        (StatusCode::OK, Json(ApiResponse::success(())))
    } else {
        not_found(&sandbox_id)
    }
}

/// List active sandboxes
pub async fn list_sandboxes(
    State(orchestrator): State<AppState>,
) -> Json<ApiResponse<Vec<SandboxInfo>>> {
    Json(ApiResponse::success(orchestrator.list_active().await))
}

/// Stop every sandbox; `data` is how many were stopped
pub async fn cleanup_sandboxes(State(orchestrator): State<AppState>) -> Json<ApiResponse<usize>> {
    let stopped = orchestrator.cleanup_all().await;
    info!("Cleanup stopped {} sandbox(es)", stopped);
    Json(ApiResponse::success(stopped))
}

/// Whether this host can run sandboxes
pub async fn get_capabilities(State(orchestrator): State<AppState>) -> Json<ApiResponse<Capabilities>> {
    Json(ApiResponse::success(orchestrator.capabilities().await))
}

/// Health check endpoint for the sandbox service
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("Sandbox service is healthy".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_sandbox_router;
    use crate::config::{SandboxConfig, SandboxRoot};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn create_test_app(root: &std::path::Path) -> Router {
        let config = SandboxConfig {
            root: SandboxRoot::Path(root.to_path_buf()),
            ..SandboxConfig::default()
        };
        create_sandbox_router().with_state(SandboxOrchestrator::new(config))
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_check() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(create_test_app(temp.path()), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_list_sandboxes_empty() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(create_test_app(temp.path()), Method::GET, "/sandboxes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_status_not_found() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(
            create_test_app(temp.path()),
            Method::GET,
            "/sandboxes/missing/status",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_logs_and_touch_not_found() {
        let temp = TempDir::new().unwrap();
        let app = create_test_app(temp.path());

        let (status, _) = send(app.clone(), Method::GET, "/sandboxes/missing/logs?limit=10", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app.clone(), Method::DELETE, "/sandboxes/missing/logs", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app, Method::POST, "/sandboxes/missing/touch", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_unknown_sandbox_reports_false() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(
            create_test_app(temp.path()),
            Method::POST,
            "/sandboxes/missing/stop",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], false);
    }

    #[tokio::test]
    async fn test_start_rejects_escaping_file_path() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(
            create_test_app(temp.path()),
            Method::POST,
            "/sandboxes/s1/start",
            Some(json!({
                "files": [{ "path": "../../etc/passwd", "content": "x" }],
                "title": "Evil"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body.get("port").is_none());
        assert!(body["error"].as_str().unwrap().contains("Invalid file path"));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_sandbox_id() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(
            create_test_app(temp.path()),
            Method::POST,
            "/sandboxes/bad.id/start",
            Some(json!({ "files": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_start_body_gets_json_error() {
        let temp = TempDir::new().unwrap();
        let app = create_test_app(temp.path());

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/sandboxes/s1/start",
            Some(json!({ "files": 42 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request body"));

        // No content type at all
        let request = Request::builder()
            .method(Method::POST)
            .uri("/sandboxes/s1/start")
            .body(Body::from("not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_logs_query_gets_json_error() {
        let temp = TempDir::new().unwrap();
        let (status, body) = send(
            create_test_app(temp.path()),
            Method::GET,
            "/sandboxes/s1/logs?limit=lots",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid query"));
    }

    #[tokio::test]
    async fn test_capabilities_and_cleanup() {
        let temp = TempDir::new().unwrap();
        let app = create_test_app(temp.path());

        let (status, body) = send(app.clone(), Method::GET, "/capabilities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sandboxing_available"], true);

        let (status, body) = send(app, Method::POST, "/sandboxes/cleanup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], 0);
    }
}
