// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across AppForge

// Control surface
pub const APPFORGE_API_PORT: &str = "APPFORGE_API_PORT";
pub const APPFORGE_API_HOST: &str = "APPFORGE_API_HOST";
pub const APPFORGE_CORS_ORIGIN: &str = "APPFORGE_CORS_ORIGIN";

// Sandbox port allocation
pub const APPFORGE_SANDBOX_PORT_MIN: &str = "APPFORGE_SANDBOX_PORT_MIN";
pub const APPFORGE_SANDBOX_PORT_MAX: &str = "APPFORGE_SANDBOX_PORT_MAX";
pub const APPFORGE_MAX_SANDBOXES: &str = "APPFORGE_MAX_SANDBOXES";

// Sandbox lifecycle
pub const APPFORGE_SANDBOX_IDLE_TIMEOUT_SECS: &str = "APPFORGE_SANDBOX_IDLE_TIMEOUT_SECS";
pub const APPFORGE_SANDBOX_REAPER_INTERVAL_SECS: &str = "APPFORGE_SANDBOX_REAPER_INTERVAL_SECS";
pub const APPFORGE_SANDBOX_STOP_GRACE_MS: &str = "APPFORGE_SANDBOX_STOP_GRACE_MS";
pub const APPFORGE_SANDBOX_LOG_CAPACITY: &str = "APPFORGE_SANDBOX_LOG_CAPACITY";

// Build pipeline
pub const APPFORGE_SANDBOX_INSTALL_COMMAND: &str = "APPFORGE_SANDBOX_INSTALL_COMMAND";
pub const APPFORGE_SANDBOX_RUN_COMMAND: &str = "APPFORGE_SANDBOX_RUN_COMMAND";
pub const APPFORGE_SANDBOX_INSTALL_TIMEOUT_SECS: &str = "APPFORGE_SANDBOX_INSTALL_TIMEOUT_SECS";
pub const APPFORGE_SANDBOX_READY_TIMEOUT_SECS: &str = "APPFORGE_SANDBOX_READY_TIMEOUT_SECS";
pub const APPFORGE_SANDBOX_PROBE_INTERVAL_MS: &str = "APPFORGE_SANDBOX_PROBE_INTERVAL_MS";
pub const APPFORGE_SANDBOX_MAX_ATTEMPTS: &str = "APPFORGE_SANDBOX_MAX_ATTEMPTS";
pub const APPFORGE_SANDBOX_RETRY_BACKOFF_MS: &str = "APPFORGE_SANDBOX_RETRY_BACKOFF_MS";

// Materialization root
pub const APPFORGE_SANDBOX_ROOT: &str = "APPFORGE_SANDBOX_ROOT";
pub const APPFORGE_SANDBOX_ROOT_MODE: &str = "APPFORGE_SANDBOX_ROOT_MODE";
pub const APPFORGE_SANDBOX_HOST: &str = "APPFORGE_SANDBOX_HOST";

// Injected into every sandbox child process
pub const PORT: &str = "PORT";
pub const HOSTNAME: &str = "HOSTNAME";
pub const NEXT_TELEMETRY_DISABLED: &str = "NEXT_TELEMETRY_DISABLED";
