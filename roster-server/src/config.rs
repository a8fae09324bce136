use anyhow::{Context, Result};
use roster_logging::{ConfigLoader, LoggingConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Runtime configuration of the server binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Time allowed for pending log deliveries after the listener stops
    pub shutdown_grace: Duration,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Resolve logging configuration from a YAML file (with environment
    /// overrides) or from the environment alone. Any error is fatal.
    pub fn load(
        bind_address: SocketAddr,
        shutdown_grace: Duration,
        logging_file: Option<&Path>,
    ) -> Result<Self> {
        let loader = ConfigLoader::new();
        let logging = match logging_file {
            Some(path) => loader
                .from_file(path)
                .with_context(|| format!("Invalid logging configuration in {}", path.display()))?,
            None => loader
                .from_env()
                .context("Invalid logging configuration in environment")?,
        };

        Ok(Self {
            bind_address,
            shutdown_grace,
            logging,
        })
    }
}
