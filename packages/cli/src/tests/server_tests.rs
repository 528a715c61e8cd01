use crate::config::{Config, ConfigError};
use crate::server::create_app;
use appforge_preview::{SandboxConfig, SandboxOrchestrator, SandboxRoot};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_config(cors_origin: &str) -> Config {
    Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 4010,
        cors_origin: cors_origin.to_string(),
    }
}

fn test_orchestrator(root: &std::path::Path) -> SandboxOrchestrator {
    SandboxOrchestrator::new(SandboxConfig {
        root: SandboxRoot::Path(root.to_path_buf()),
        ..SandboxConfig::default()
    })
}

#[tokio::test]
async fn test_app_serves_sandbox_routes() {
    let temp = TempDir::new().unwrap();
    let app = create_app(test_orchestrator(temp.path()), &test_config("http://localhost:3000")).unwrap();

    let response = app
        .oneshot(Request::builder().uri("/sandboxes").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], serde_json::json!([]));
}

#[tokio::test]
async fn test_cors_preflight_allows_configured_origin() {
    let temp = TempDir::new().unwrap();
    let app = create_app(test_orchestrator(temp.path()), &test_config("http://localhost:3000")).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/sandboxes/demo/start")
                .header("origin", "http://localhost:3000")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );
}

#[tokio::test]
async fn test_invalid_cors_origin_is_rejected() {
    let temp = TempDir::new().unwrap();
    let result = create_app(test_orchestrator(temp.path()), &test_config("bad\norigin"));

    assert!(matches!(result, Err(ConfigError::InvalidCorsOrigin(_))));
}
