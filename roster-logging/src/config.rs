//! Logging pipeline configuration
//!
//! A [`LoggingConfig`] can be read from YAML or assembled from the process
//! environment with [`ConfigLoader`]. Missing or invalid values are fatal:
//! a misconfigured aggregator must stop the process at boot.

use crate::event::LogLevel;
use crate::formatter::{EnvelopeFormat, LocalEnvelope, DEFAULT_ALLOWED_FIELDS};
use crate::router::{RecordFilter, SinkBinding, SinkRouter};
use crate::sinks::{ConsoleSink, RemoteConfig, RemoteSink, RotatingFileSink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Invalid size format: {0}")]
    InvalidSize(String),

    #[error("Failed to create sink {name}: {message}")]
    SinkCreation { name: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Lowers the local and remote thresholds from INFO to DEBUG
    #[serde(default)]
    pub debug: bool,

    /// Context keys surfaced in console and file output
    #[serde(default = "default_allowed_fields")]
    pub allowed_fields: Vec<String>,

    /// Emit to the process stdout/stderr streams
    #[serde(default = "default_console")]
    pub console: bool,

    /// File receiving DEBUG, INFO and WARNING records
    #[serde(default)]
    pub stdout_file: Option<PathBuf>,

    /// File receiving ERROR records
    #[serde(default)]
    pub stderr_file: Option<PathBuf>,

    #[serde(default)]
    pub rotation: RotationConfig,

    /// Remote aggregator; local sinks only when absent
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Size that triggers rotation (e.g. "1MB")
    #[serde(default = "default_max_size")]
    pub max_size: String,
    /// Rotated generations kept next to the active file
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_files: default_max_files(),
        }
    }
}

impl RotationConfig {
    pub fn max_size_bytes(&self) -> ConfigResult<u64> {
        parse_size(&self.max_size)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            allowed_fields: default_allowed_fields(),
            console: default_console(),
            stdout_file: None,
            stderr_file: None,
            rotation: RotationConfig::default(),
            remote: None,
        }
    }
}

impl LoggingConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoggingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Threshold of the local sinks and of the remote sink
    pub fn level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.rotation.max_size_bytes()? == 0 {
            return Err(ConfigError::ValidationError(
                "rotation.max_size must be greater than zero".to_string(),
            ));
        }
        if self.rotation.max_files == 0 {
            return Err(ConfigError::ValidationError(
                "rotation.max_files must be greater than zero".to_string(),
            ));
        }

        if let Some(remote) = &self.remote {
            validate_remote(remote)?;
        }

        Ok(())
    }

    /// Build the standard sink bindings.
    ///
    /// Bindings are created in a fixed order: console stdout, console stderr,
    /// file stdout, file stderr, remote. Must run inside a tokio runtime when
    /// a remote sink is configured.
    pub fn build_router(&self) -> ConfigResult<SinkRouter> {
        let level = self.level();
        let local = EnvelopeFormat::Local(LocalEnvelope::new(self.allowed_fields.clone()));
        let mut builder = SinkRouter::builder();

        if self.console {
            builder = builder
                .add_binding(
                    SinkBinding::new("console_stdout", Arc::new(ConsoleSink::stdout()))
                        .with_min_level(level)
                        .with_filter(RecordFilter::BelowError)
                        .with_format(local.clone()),
                )
                .add_binding(
                    SinkBinding::new("console_stderr", Arc::new(ConsoleSink::stderr()))
                        .with_min_level(LogLevel::Error)
                        .with_filter(RecordFilter::AtOrAboveError)
                        .with_format(local.clone()),
                );
        }

        if let Some(path) = &self.stdout_file {
            let sink = self.file_sink("file_stdout", path)?;
            builder = builder.add_binding(
                SinkBinding::new("file_stdout", Arc::new(sink))
                    .with_min_level(level)
                    .with_filter(RecordFilter::BelowError)
                    .with_format(local.clone()),
            );
        }

        if let Some(path) = &self.stderr_file {
            let sink = self.file_sink("file_stderr", path)?;
            builder = builder.add_binding(
                SinkBinding::new("file_stderr", Arc::new(sink))
                    .with_min_level(LogLevel::Error)
                    .with_filter(RecordFilter::AtOrAboveError)
                    .with_format(local),
            );
        }

        if let Some(remote) = &self.remote {
            let sink = RemoteSink::spawn(remote.clone()).map_err(|e| ConfigError::SinkCreation {
                name: "remote".to_string(),
                message: e.to_string(),
            })?;
            builder = builder.add_binding(
                SinkBinding::new("remote", Arc::new(sink))
                    .with_min_level(level)
                    .with_filter(RecordFilter::All)
                    .with_format(EnvelopeFormat::aggregator()),
            );
        }

        Ok(builder.build())
    }

    fn file_sink(&self, name: &str, path: &Path) -> ConfigResult<RotatingFileSink> {
        let sink = RotatingFileSink::new(path).map_err(|e| ConfigError::SinkCreation {
            name: name.to_string(),
            message: format!("{}: {}", path.display(), e),
        })?;
        Ok(sink.with_rotation(self.rotation.max_size_bytes()?, self.rotation.max_files))
    }
}

fn validate_remote(remote: &RemoteConfig) -> ConfigResult<()> {
    if remote.url.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "remote.url cannot be empty".to_string(),
        ));
    }

    let url = url::Url::parse(&remote.url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "remote.url must use http or https, got {}",
            url.scheme()
        )));
    }

    if remote.application.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "remote.application cannot be empty".to_string(),
        ));
    }

    if remote.timeout.is_zero() {
        return Err(ConfigError::ValidationError(
            "remote.timeout must be greater than zero".to_string(),
        ));
    }

    if remote.queue_capacity == 0 || remote.batch_size == 0 {
        return Err(ConfigError::ValidationError(
            "remote.queue_capacity and remote.batch_size must be greater than zero".to_string(),
        ));
    }

    if remote.retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "remote.retry.max_attempts must be greater than zero".to_string(),
        ));
    }

    let multiplier = remote.retry.backoff_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::ValidationError(format!(
            "remote.retry.backoff_multiplier must be a finite number >= 1.0, got {}",
            multiplier
        )));
    }

    Ok(())
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds a [`LoggingConfig`] from environment variables.
///
/// | variable              | meaning                                   |
/// |-----------------------|-------------------------------------------|
/// | `DEBUG`               | `true` (any case) enables DEBUG records   |
/// | `LOKI_URL`            | aggregator push endpoint (required)       |
/// | `APP_NAME`            | `application` label (required)            |
/// | `LOG_DIR`             | directory of the two log files            |
/// | `LOG_ROTATION_SIZE`   | rotation size, e.g. `1MB`                 |
/// | `LOG_MAX_FILES`       | rotated generations kept                  |
/// | `LOKI_TIMEOUT_SECS`   | per-request push timeout                  |
/// | `LOKI_QUEUE_CAPACITY` | bounded delivery queue size               |
pub struct ConfigLoader {
    lookup: EnvLookup,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading the process environment
    pub fn new() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Loader reading a fixed set of variables instead of the environment
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            lookup: Box::new(move |name| vars.get(name).cloned()),
        }
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<LoggingConfig> {
        let url = self.required("LOKI_URL")?;
        let application = self.required("APP_NAME")?;

        let mut config = LoggingConfig {
            debug: self.flag("DEBUG"),
            remote: Some(RemoteConfig::new(url, application)),
            ..LoggingConfig::default()
        };

        let log_dir = self
            .var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        config.stdout_file = Some(log_dir.join(STDOUT_FILE_NAME));
        config.stderr_file = Some(log_dir.join(STDERR_FILE_NAME));

        self.apply_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, then apply any environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<LoggingConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: LoggingConfig = serde_yaml::from_str(&content)?;

        if self.var("DEBUG").is_some() {
            config.debug = self.flag("DEBUG");
        }
        if let Some(url) = self.var("LOKI_URL") {
            match config.remote.as_mut() {
                Some(remote) => remote.url = url,
                None => config.remote = Some(RemoteConfig::new(url, self.required("APP_NAME")?)),
            }
        }
        if let (Some(remote), Some(application)) = (config.remote.as_mut(), self.var("APP_NAME")) {
            remote.application = application;
        }
        if let Some(dir) = self.var("LOG_DIR") {
            let dir = PathBuf::from(dir);
            config.stdout_file = Some(dir.join(STDOUT_FILE_NAME));
            config.stderr_file = Some(dir.join(STDERR_FILE_NAME));
        }

        self.apply_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Some(size) = self.var("LOG_ROTATION_SIZE") {
            parse_size(&size)?;
            config.rotation.max_size = size;
        }

        if let Some(max_files) = self.var("LOG_MAX_FILES") {
            config.rotation.max_files = max_files
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid LOG_MAX_FILES: {}", e)))?;
        }

        if let Some(remote) = config.remote.as_mut() {
            if let Some(timeout) = self.var("LOKI_TIMEOUT_SECS") {
                let seconds: u64 = timeout.parse().map_err(|e| {
                    ConfigError::EnvError(format!("Invalid LOKI_TIMEOUT_SECS: {}", e))
                })?;
                remote.timeout = Duration::from_secs(seconds);
            }

            if let Some(capacity) = self.var("LOKI_QUEUE_CAPACITY") {
                remote.queue_capacity = capacity.parse().map_err(|e| {
                    ConfigError::EnvError(format!("Invalid LOKI_QUEUE_CAPACITY: {}", e))
                })?;
            }
        }

        Ok(())
    }

    /// Non-empty value of a variable
    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> ConfigResult<String> {
        self.var(name)
            .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
    }

    fn flag(&self, name: &str) -> bool {
        self.var(name)
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

const DEFAULT_LOG_DIR: &str = "/var/log";
const STDOUT_FILE_NAME: &str = "roster_stdout.log";
const STDERR_FILE_NAME: &str = "roster_stderr.log";

fn default_allowed_fields() -> Vec<String> {
    DEFAULT_ALLOWED_FIELDS.iter().map(|k| k.to_string()).collect()
}

fn default_console() -> bool {
    true
}

fn default_max_size() -> String {
    "1MB".to_string()
}

fn default_max_files() -> usize {
    5
}

/// Parse a human size such as `512`, `10KB`, `1 MB` or `2GB`
pub fn parse_size(size_str: &str) -> ConfigResult<u64> {
    let normalized = size_str.trim().to_uppercase();
    let invalid = || ConfigError::InvalidSize(size_str.to_string());

    let (number, multiplier) = [("GB", 1024 * 1024 * 1024), ("MB", 1024 * 1024), ("KB", 1024)]
        .iter()
        .find_map(|(suffix, multiplier)| {
            normalized
                .strip_suffix(suffix)
                .map(|number| (number.trim(), *multiplier))
        })
        .unwrap_or((normalized.as_str(), 1));

    number
        .parse::<u64>()
        .map_err(|_| invalid())?
        .checked_mul(multiplier)
        .ok_or_else(invalid)
}
