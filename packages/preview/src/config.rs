// ABOUTME: Sandbox orchestrator configuration
// ABOUTME: Port range, capacity, timeouts, commands and materialization root loaded from env

use appforge_config::constants;
use appforge_config::env::{env_string, env_string_or, parse_env_or_default_with_validation};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Where sandbox project directories are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxRoot {
    /// `<current dir>/.sandboxes`, for local development previews
    Workspace,
    /// `<system temp dir>/appforge-sandboxes`, for hosts with read-only app directories
    Scratch,
    /// An explicit directory
    Path(PathBuf),
}

impl SandboxRoot {
    /// Resolve to an absolute directory. Relative paths are taken from the current directory.
    pub fn resolve(&self) -> PathBuf {
        match self {
            SandboxRoot::Workspace => std::env::current_dir()
                .unwrap_or_else(|_| std::env::temp_dir())
                .join(".sandboxes"),
            SandboxRoot::Scratch => std::env::temp_dir().join("appforge-sandboxes"),
            SandboxRoot::Path(path) if path.is_absolute() => path.clone(),
            SandboxRoot::Path(path) => std::env::current_dir()
                .unwrap_or_else(|_| std::env::temp_dir())
                .join(path),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub port_min: u16,
    pub port_max: u16,
    pub max_sandboxes: usize,
    pub root: SandboxRoot,
    /// Host name used when building sandbox URLs
    pub public_host: String,
    pub install_command: String,
    /// Run command; `{port}` is replaced with the allocated port
    pub run_command: String,
    /// `None` leaves the install step unbounded
    pub install_timeout: Option<Duration>,
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub stop_grace: Duration,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub log_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            port_min: 3100,
            port_max: 3199,
            max_sandboxes: 10,
            root: SandboxRoot::Workspace,
            public_host: "localhost".to_string(),
            install_command: "npm install".to_string(),
            run_command: "npm run dev".to_string(),
            install_timeout: Some(Duration::from_secs(300)),
            ready_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_millis(1500),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            log_capacity: 1000,
        }
    }
}

impl SandboxConfig {
    /// Build a configuration from `APPFORGE_*` environment variables.
    ///
    /// Invalid values are logged and replaced by defaults; an inverted port range
    /// falls back to the default range as a whole.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut port_min = parse_env_or_default_with_validation(
            constants::APPFORGE_SANDBOX_PORT_MIN,
            defaults.port_min,
            |p: u16| p >= 1024,
        );
        let mut port_max = parse_env_or_default_with_validation(
            constants::APPFORGE_SANDBOX_PORT_MAX,
            defaults.port_max,
            |p: u16| p >= 1024,
        );
        if port_min > port_max {
            warn!(
                "Sandbox port range {}-{} is inverted, using default {}-{}",
                port_min, port_max, defaults.port_min, defaults.port_max
            );
            port_min = defaults.port_min;
            port_max = defaults.port_max;
        }

        let root = match env_string(constants::APPFORGE_SANDBOX_ROOT) {
            Some(path) => SandboxRoot::Path(PathBuf::from(path)),
            None => match env_string_or(constants::APPFORGE_SANDBOX_ROOT_MODE, "workspace")
                .to_lowercase()
                .as_str()
            {
                "scratch" | "tmp" => SandboxRoot::Scratch,
                "workspace" => SandboxRoot::Workspace,
                other => {
                    warn!(
                        "Unknown sandbox root mode '{}', using workspace",
                        other
                    );
                    SandboxRoot::Workspace
                }
            },
        };

        let install_timeout_secs = parse_env_or_default_with_validation(
            constants::APPFORGE_SANDBOX_INSTALL_TIMEOUT_SECS,
            300u64,
            |v| v <= 3600,
        );

        Self {
            port_min,
            port_max,
            max_sandboxes: parse_env_or_default_with_validation(
                constants::APPFORGE_MAX_SANDBOXES,
                defaults.max_sandboxes,
                |v| v > 0,
            ),
            root,
            public_host: env_string_or(constants::APPFORGE_SANDBOX_HOST, &defaults.public_host),
            install_command: env_string_or(
                constants::APPFORGE_SANDBOX_INSTALL_COMMAND,
                &defaults.install_command,
            ),
            run_command: env_string_or(
                constants::APPFORGE_SANDBOX_RUN_COMMAND,
                &defaults.run_command,
            ),
            install_timeout: (install_timeout_secs > 0)
                .then(|| Duration::from_secs(install_timeout_secs)),
            ready_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_READY_TIMEOUT_SECS,
                120u64,
                |v| (5..=1800).contains(&v),
            )),
            probe_interval: Duration::from_millis(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_PROBE_INTERVAL_MS,
                1500u64,
                |v| (100..=10_000).contains(&v),
            )),
            max_attempts: parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_MAX_ATTEMPTS,
                defaults.max_attempts,
                |v| (1..=10).contains(&v),
            ),
            retry_backoff: Duration::from_millis(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_RETRY_BACKOFF_MS,
                2000u64,
                |v| v <= 60_000,
            )),
            stop_grace: Duration::from_millis(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_STOP_GRACE_MS,
                5000u64,
                |v| v <= 60_000,
            )),
            idle_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_IDLE_TIMEOUT_SECS,
                1800u64,
                |v| v >= 10,
            )),
            reaper_interval: Duration::from_secs(parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_REAPER_INTERVAL_SECS,
                60u64,
                |v| (1..=3600).contains(&v),
            )),
            log_capacity: parse_env_or_default_with_validation(
                constants::APPFORGE_SANDBOX_LOG_CAPACITY,
                defaults.log_capacity,
                |v| (10..=100_000).contains(&v),
            ),
        }
    }

    /// Public URL for a sandbox bound to `port`
    pub fn sandbox_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.public_host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            constants::APPFORGE_SANDBOX_PORT_MIN,
            constants::APPFORGE_SANDBOX_PORT_MAX,
            constants::APPFORGE_SANDBOX_ROOT,
            constants::APPFORGE_SANDBOX_ROOT_MODE,
            constants::APPFORGE_SANDBOX_INSTALL_TIMEOUT_SECS,
            constants::APPFORGE_MAX_SANDBOXES,
            constants::APPFORGE_SANDBOX_RUN_COMMAND,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = SandboxConfig::from_env();
        assert_eq!(config.port_min, 3100);
        assert_eq!(config.port_max, 3199);
        assert_eq!(config.max_sandboxes, 10);
        assert_eq!(config.root, SandboxRoot::Workspace);
        assert_eq!(config.run_command, "npm run dev");
        assert_eq!(config.install_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    #[serial]
    fn test_relative_root_resolves_against_current_dir() {
        clear_env();
        std::env::set_var(constants::APPFORGE_SANDBOX_ROOT, "previews/out");
        let root = SandboxConfig::from_env().root.resolve();
        assert!(root.is_absolute());
        assert_eq!(root, std::env::current_dir().unwrap().join("previews/out"));

        let absolute = std::env::temp_dir().join("abs-root");
        assert_eq!(SandboxRoot::Path(absolute.clone()).resolve(), absolute);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_inverted_port_range_falls_back() {
        clear_env();
        std::env::set_var(constants::APPFORGE_SANDBOX_PORT_MIN, "4000");
        std::env::set_var(constants::APPFORGE_SANDBOX_PORT_MAX, "3500");
        let config = SandboxConfig::from_env();
        assert_eq!((config.port_min, config.port_max), (3100, 3199));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_root_selection() {
        clear_env();
        std::env::set_var(constants::APPFORGE_SANDBOX_ROOT_MODE, "scratch");
        assert_eq!(SandboxConfig::from_env().root, SandboxRoot::Scratch);

        std::env::set_var(constants::APPFORGE_SANDBOX_ROOT, "/srv/sandboxes");
        assert_eq!(
            SandboxConfig::from_env().root,
            SandboxRoot::Path(PathBuf::from("/srv/sandboxes"))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_install_timeout_disables_limit() {
        clear_env();
        std::env::set_var(constants::APPFORGE_SANDBOX_INSTALL_TIMEOUT_SECS, "0");
        assert_eq!(SandboxConfig::from_env().install_timeout, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_capacity_rejected() {
        clear_env();
        std::env::set_var(constants::APPFORGE_MAX_SANDBOXES, "0");
        assert_eq!(SandboxConfig::from_env().max_sandboxes, 10);
        clear_env();
    }

    #[test]
    fn test_scratch_root_is_under_temp_dir() {
        assert!(SandboxRoot::Scratch
            .resolve()
            .starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_sandbox_url() {
        let config = SandboxConfig::default();
        assert_eq!(config.sandbox_url(3105), "http://localhost:3105");
    }
}
