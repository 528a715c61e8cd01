pub mod config;
pub mod server;

pub use config::{Config, ConfigError};
pub use server::{create_app, run_server};

/// Install the global tracing subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests;
