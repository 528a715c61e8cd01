// ABOUTME: Core data types for sandbox orchestration
// ABOUTME: Sandbox status machine, log entries, error taxonomy and HTTP payload shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a sandbox.
///
/// Moves forward only: `starting → installing → building → running → (stopped | failed)`.
/// `failed` is reachable from every non-terminal state, `stopped` only from `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Starting,
    Installing,
    Building,
    Running,
    Stopped,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Starting => "starting",
            SandboxStatus::Installing => "installing",
            SandboxStatus::Building => "building",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SandboxStatus::Starting => 0,
            SandboxStatus::Installing => 1,
            SandboxStatus::Building => 2,
            SandboxStatus::Running => 3,
            SandboxStatus::Stopped | SandboxStatus::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Stopped | SandboxStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_advance_to(&self, next: SandboxStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SandboxStatus::Failed => true,
            SandboxStatus::Stopped => *self == SandboxStatus::Running,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase a log line was produced in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPhase {
    Install,
    Run,
    System,
}

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
    System,
}

/// Sandbox log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLog {
    pub timestamp: DateTime<Utc>,
    pub phase: LogPhase,
    pub log_type: LogType,
    pub message: String,
}

impl SandboxLog {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: LogPhase::System,
            log_type: LogType::System,
            message: message.into(),
        }
    }

    /// Render as a single tagged line, e.g. `[install:stderr] npm WARN deprecated`.
    pub fn render(&self) -> String {
        let phase = match self.phase {
            LogPhase::Install => "install",
            LogPhase::Run => "run",
            LogPhase::System => "system",
        };
        match self.log_type {
            LogType::Stdout => format!("[{}] {}", phase, self.message),
            LogType::Stderr => format!("[{}:stderr] {}", phase, self.message),
            LogType::System if self.phase == LogPhase::System => {
                format!("[system] {}", self.message)
            }
            LogType::System => format!("[{}:info] {}", phase, self.message),
        }
    }
}

/// One generated source file, path relative to the project root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Point-in-time view of a sandbox, safe to hand to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    /// Distinguishes restarts under the same sandbox id
    pub instance_id: Uuid,
    pub title: String,
    pub project_dir: PathBuf,
    pub port: u16,
    pub url: String,
    pub pid: Option<u32>,
    pub status: SandboxStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    /// Set when the sandbox is torn down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_access: DateTime<Utc>,
    pub build_progress: String,
    pub error: Option<String>,
}

impl SandboxInfo {
    /// Seconds since start, frozen once the sandbox has ended
    pub fn uptime_secs(&self) -> i64 {
        let until = self.ended_at.unwrap_or_else(Utc::now);
        (until - self.started_at).num_seconds().max(0)
    }
}

/// Error types for sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Invalid sandbox id '{sandbox_id}': {reason}")]
    InvalidSandboxId { sandbox_id: String, reason: String },

    #[error("Invalid file path '{path}': {reason}")]
    InvalidFilePath { path: String, reason: String },

    #[error("Sandbox capacity exceeded: {max} sandboxes already active")]
    CapacityExceeded { max: usize },

    #[error("No available ports in range {min}-{max}")]
    NoPortsAvailable { min: u16, max: u16 },

    #[error("Failed to materialize project in {dir:?}: {reason}")]
    MaterializationFailed { dir: PathBuf, reason: String },

    #[error("Dependency install failed: {reason}")]
    InstallFailed { reason: String },

    #[error("Build failed: {excerpt}")]
    BuildFailed { excerpt: String },

    #[error("Server on port {port} did not become ready within {timeout_secs}s")]
    ReadinessTimeout { port: u16, timeout_secs: u64 },

    #[error("Sandbox process crashed: {reason}")]
    ProcessCrashed { reason: String },

    #[error("Failed to spawn process '{command}': {error}")]
    ProcessSpawnError { command: String, error: String },

    #[error("Failed to kill process with PID {pid}: {error}")]
    ProcessKillError { pid: u32, error: String },

    #[error("Sandbox {sandbox_id} was stopped before it became ready")]
    Cancelled { sandbox_id: String },

    #[error("Sandbox {sandbox_id} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        sandbox_id: String,
        attempts: u32,
        #[source]
        last_error: Box<SandboxError>,
        logs: Vec<String>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether the start pipeline should try again after this error.
    ///
    /// Resource exhaustion, bad input and cancellation repeat identically on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SandboxError::InvalidSandboxId { .. }
                | SandboxError::InvalidFilePath { .. }
                | SandboxError::CapacityExceeded { .. }
                | SandboxError::NoPortsAvailable { .. }
                | SandboxError::Cancelled { .. }
                | SandboxError::RetriesExhausted { .. }
        )
    }

    /// Accumulated log trail, present only on terminal pipeline errors.
    pub fn logs(&self) -> &[String] {
        match self {
            SandboxError::RetriesExhausted { logs, .. } => logs,
            _ => &[],
        }
    }
}

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Request/Response types for API endpoints

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSandboxRequest {
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub title: String,
}

/// Flat start payload: `{success, port, url}` or `{success: false, error, logs}`
#[derive(Debug, Serialize, Deserialize)]
pub struct StartSandboxResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl StartSandboxResponse {
    pub fn started(info: &SandboxInfo) -> Self {
        Self {
            success: true,
            port: Some(info.port),
            url: Some(info.url.clone()),
            error: None,
            logs: Vec::new(),
        }
    }

    /// Failure before the request reached the orchestrator, e.g. an unreadable body
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            port: None,
            url: None,
            error: Some(message.into()),
            logs: Vec::new(),
        }
    }

    pub fn failed(error: &SandboxError) -> Self {
        Self {
            success: false,
            port: None,
            url: None,
            error: Some(error.to_string()),
            logs: error.logs().to_vec(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxStatusResponse {
    pub status: SandboxStatus,
    pub port: u16,
    pub uptime: i64,
    pub url: String,
    pub build_progress: String,
    pub error: Option<String>,
}

impl From<&SandboxInfo> for SandboxStatusResponse {
    fn from(info: &SandboxInfo) -> Self {
        Self {
            status: info.status,
            port: info.port,
            uptime: info.uptime_secs(),
            url: info.url.clone(),
            build_progress: info.build_progress.clone(),
            error: info.error.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxLogsRequest {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxLogsResponse {
    pub logs: Vec<SandboxLog>,
    pub status: SandboxStatus,
    pub build_progress: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub sandboxing_available: bool,
    pub root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error<E: ToString>(error: E) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> SandboxInfo {
        let now = Utc::now();
        SandboxInfo {
            sandbox_id: "s1".to_string(),
            instance_id: Uuid::new_v4(),
            title: "App".to_string(),
            project_dir: PathBuf::from("/tmp/s1"),
            port: 3100,
            url: "http://localhost:3100".to_string(),
            pid: None,
            status: SandboxStatus::Running,
            attempt: 1,
            started_at: now - chrono::Duration::seconds(90),
            ended_at: None,
            last_access: now,
            build_progress: "Running".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_uptime_stops_counting_once_ended() {
        let mut info = sample_info();
        assert!(info.uptime_secs() >= 90);

        info.status = SandboxStatus::Failed;
        info.ended_at = Some(info.started_at + chrono::Duration::seconds(30));
        assert_eq!(info.uptime_secs(), 30);
        assert_eq!(SandboxStatusResponse::from(&info).uptime, 30);
    }

    #[test]
    fn test_status_moves_forward_only() {
        use SandboxStatus::*;
        assert!(Starting.can_advance_to(Installing));
        assert!(Installing.can_advance_to(Building));
        assert!(Starting.can_advance_to(Running));
        assert!(Building.can_advance_to(Running));
        assert!(!Running.can_advance_to(Building));
        assert!(!Building.can_advance_to(Installing));
        assert!(!Running.can_advance_to(Running));
    }

    #[test]
    fn test_stopped_only_after_running() {
        use SandboxStatus::*;
        assert!(Running.can_advance_to(Stopped));
        assert!(!Starting.can_advance_to(Stopped));
        assert!(!Installing.can_advance_to(Stopped));
        assert!(!Building.can_advance_to(Stopped));
    }

    #[test]
    fn test_failed_reachable_from_any_live_state() {
        use SandboxStatus::*;
        for status in [Starting, Installing, Building, Running] {
            assert!(status.can_advance_to(Failed), "{} -> failed", status);
        }
        assert!(!Stopped.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
    }

    #[test]
    fn test_log_render_tags_phase_and_stream() {
        let mut log = SandboxLog::system("Allocated port 3100");
        assert_eq!(log.render(), "[system] Allocated port 3100");

        log.phase = LogPhase::Install;
        log.log_type = LogType::Stderr;
        log.message = "npm WARN deprecated".to_string();
        assert_eq!(log.render(), "[install:stderr] npm WARN deprecated");

        log.phase = LogPhase::Run;
        log.log_type = LogType::Stdout;
        log.message = "ready".to_string();
        assert_eq!(log.render(), "[run] ready");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!SandboxError::CapacityExceeded { max: 1 }.is_retryable());
        assert!(!SandboxError::NoPortsAvailable { min: 1, max: 2 }.is_retryable());
        assert!(SandboxError::InstallFailed {
            reason: "exit 1".into()
        }
        .is_retryable());
        assert!(SandboxError::ReadinessTimeout {
            port: 3100,
            timeout_secs: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_start_response_failure_carries_logs() {
        let err = SandboxError::RetriesExhausted {
            sandbox_id: "s1".into(),
            attempts: 3,
            last_error: Box::new(SandboxError::BuildFailed {
                excerpt: "SyntaxError".into(),
            }),
            logs: vec!["[run:stderr] SyntaxError".into()],
        };
        let response = StartSandboxResponse::failed(&err);
        assert!(!response.success);
        assert_eq!(response.logs.len(), 1);
        assert!(response.error.unwrap().contains("after 3 attempt(s)"));

        let json = serde_json::to_value(StartSandboxResponse::failed(&SandboxError::CapacityExceeded {
            max: 2,
        }))
        .unwrap();
        assert!(json.get("port").is_none());
        assert!(json.get("logs").is_none());
    }
}
