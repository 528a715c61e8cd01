// ABOUTME: Control server configuration
// ABOUTME: Listen address and CORS origin read from APPFORGE_* environment variables

use appforge_config::constants;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::num::ParseIntError;
use thiserror::Error;

pub const DEFAULT_API_PORT: u16 = 4010;
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid host address: {0}")]
    InvalidHost(String),
    #[error("Invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub cors_origin: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var(constants::APPFORGE_API_PORT) {
            Ok(value) => value.trim().parse::<u16>()?,
            Err(_) => DEFAULT_API_PORT,
        };
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let host_str = env::var(constants::APPFORGE_API_HOST)
            .unwrap_or_else(|_| DEFAULT_API_HOST.to_string());
        let host = host_str
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(host_str.clone()))?;

        let cors_origin = env::var(constants::APPFORGE_CORS_ORIGIN)
            .unwrap_or_else(|_| DEFAULT_CORS_ORIGIN.to_string());

        Ok(Config {
            host,
            port,
            cors_origin,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
