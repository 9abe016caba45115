//! Relay configuration, read from the environment.

use std::env;
use std::path::PathBuf;

/// Runtime settings for the relay process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Directory holding one SQLite database per dataset
    pub data_dir: PathBuf,
    /// Shared secret replicas must present; `None` allows anonymous access
    pub auth_secret: Option<String>,
}

impl Config {
    /// Read `HOST`, `PORT`, `DATA_DIR`, and `AUTH_SECRET`, with defaults
    /// suited to local development.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => 3000,
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            auth_secret: env::var("AUTH_SECRET").ok(),
        })
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid PORT value: {0}")]
    InvalidPort(String),
}
