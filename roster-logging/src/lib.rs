//! Structured logging core for Roster
//!
//! This crate provides:
//! - Immutable log records with call-site and error chain capture
//! - Layered, request-scoped context bound to cheap logger handles
//! - A local JSON-lines envelope and an aggregator envelope with labels
//! - A sink router fanning each record out to console, rotating file and
//!   remote aggregator sinks, isolating failures per sink
//!
//! ```no_run
//! use roster_logging::{fields, init_logging_from_config, LoggingConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let logger = init_logging_from_config(&LoggingConfig::default())?;
//! let request = logger.request_scoped("10.0.0.1", "GET", "/users", "abc123");
//! request.info_with("All users shown", fields! { "user_id" => 7 });
//! logger.router().shutdown(std::time::Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error_info;
pub mod event;
pub mod formatter;
pub mod init;
pub mod logger;
pub mod router;
pub mod sinks;

// Re-export main types for convenience
pub use config::{parse_size, ConfigError, ConfigLoader, ConfigResult, LoggingConfig, RotationConfig};
pub use context::{current_request_id, with_request_id, Fields, LogContext};
pub use error_info::{ExceptionEntry, ExceptionInfo};
pub use event::{LogEvent, LogLevel, SourceLocation};
pub use formatter::{
    AggregatorEntry, AggregatorEnvelope, EnvelopeFormat, FormattedRecord, LocalEnvelope,
    DEFAULT_ALLOWED_FIELDS, METADATA_KEY,
};
pub use init::{init_diagnostics, init_logging_from_config};
pub use logger::Logger;
pub use router::{
    at_or_above_error_threshold, below_error_threshold, BindingStats, RecordFilter, SinkBinding,
    SinkRouter, SinkRouterBuilder,
};
pub use sinks::{
    ConsoleSink, ConsoleStream, LogSink, RemoteConfig, RemoteSink, RemoteStats,
    RemoteStatsSnapshot, RetryPolicy, RotatingFileSink, SinkError,
};
