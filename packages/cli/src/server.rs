// ABOUTME: HTTP control server for sandboxes
// ABOUTME: Wires the orchestrator router with CORS and tracing, and cleans up on shutdown

use crate::config::{Config, ConfigError};
use anyhow::Context;
use appforge_preview::{create_sandbox_router, SandboxOrchestrator};
use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build the control router around an orchestrator.
pub fn create_app(orchestrator: SandboxOrchestrator, config: &Config) -> Result<Router, ConfigError> {
    let origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|_| ConfigError::InvalidCorsOrigin(config.cors_origin.clone()))?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Ok(create_sandbox_router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator))
}

/// Serve the control surface until SIGINT/SIGTERM, then stop every sandbox.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let (orchestrator, reaper) = appforge_preview::init();

    let capabilities = orchestrator.capabilities().await;
    if capabilities.sandboxing_available {
        info!("Sandbox root: {}", capabilities.root.display());
    } else {
        warn!(
            "Sandbox root {} is not writable; starts will fail until it is",
            capabilities.root.display()
        );
    }

    let app = create_app(orchestrator.clone(), &config)?;

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control server to {}", addr))?;
    info!("AppForge control server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control server failed")?;

    info!("Shutting down, stopping all sandboxes");
    reaper.abort();
    let stopped = orchestrator.cleanup_all().await;
    info!("Stopped {} sandbox(es)", stopped);

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to register signal handlers, using Ctrl+C only: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
