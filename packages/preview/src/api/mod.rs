pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use handlers::AppState;

/// Create the sandbox control router.
///
/// The caller supplies the orchestrator with `.with_state(..)` and adds its own layers.
pub fn create_sandbox_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/capabilities", get(handlers::get_capabilities))
        .route("/sandboxes", get(handlers::list_sandboxes))
        .route("/sandboxes/cleanup", post(handlers::cleanup_sandboxes))
        .route("/sandboxes/{id}/start", post(handlers::start_sandbox))
        .route("/sandboxes/{id}/status", get(handlers::get_sandbox_status))
        .route(
            "/sandboxes/{id}/logs",
            get(handlers::get_sandbox_logs).delete(handlers::clear_sandbox_logs),
        )
        .route("/sandboxes/{id}/touch", post(handlers::touch_sandbox))
        .route("/sandboxes/{id}/stop", post(handlers::stop_sandbox))
}
