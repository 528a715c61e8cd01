//! AppForge Preview - Sandbox process orchestration
//!
//! This crate turns a set of generated source files into a running development
//! server: it materializes the project, installs dependencies, launches the dev
//! server on an allocated port, waits for it to answer, and tears it down again
//! on stop, crash or inactivity.

pub mod api;
pub mod config;
pub mod logs;
pub mod materializer;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod reaper;
pub mod supervisor;
pub mod types;
pub mod validation;

// Re-export key types and functions for easier use
pub use api::create_sandbox_router;
pub use config::{SandboxConfig, SandboxRoot};
pub use logs::LogBuffer;
pub use materializer::ProjectMaterializer;
pub use orchestrator::SandboxOrchestrator;
pub use ports::PortAllocator;
pub use probe::ReadinessProbe;
pub use reaper::start_idle_reaper;
pub use supervisor::{ExitInfo, ProcessEvent, ProcessHandle, ProcessSupervisor};
pub use types::{
    ApiResponse, Capabilities, GeneratedFile, LogPhase, LogType, SandboxError, SandboxInfo,
    SandboxLog, SandboxLogsRequest, SandboxLogsResponse, SandboxResult, SandboxStatus,
    SandboxStatusResponse, StartSandboxRequest, StartSandboxResponse,
};

/// Create an orchestrator from the environment and start its idle reaper.
///
/// # Returns
///
/// The orchestrator and the reaper task handle; abort the handle on shutdown.
///
/// # Examples
///
/// ```no_run
/// use appforge_preview::init;
///
/// #[tokio::main]
/// async fn main() {
///     let (orchestrator, reaper) = init();
///     // Serve appforge_preview::create_sandbox_router().with_state(orchestrator.clone())
///     reaper.abort();
///     orchestrator.cleanup_all().await;
/// }
/// ```
pub fn init() -> (SandboxOrchestrator, tokio::task::JoinHandle<()>) {
    let orchestrator = SandboxOrchestrator::new(SandboxConfig::from_env());
    let reaper = start_idle_reaper(orchestrator.clone());
    (orchestrator, reaper)
}

/// Version information for the preview crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn test_init_starts_empty() {
        let (orchestrator, reaper) = init();
        assert!(orchestrator.list_active().await.is_empty());
        reaper.abort();
    }
}
