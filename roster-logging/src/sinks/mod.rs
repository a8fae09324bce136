pub mod console;
pub mod file;
pub mod remote;

pub use console::{ConsoleSink, ConsoleStream};
pub use file::RotatingFileSink;
pub use remote::{RemoteConfig, RemoteSink, RemoteStats, RemoteStatsSnapshot, RetryPolicy};

use crate::formatter::FormattedRecord;
use async_trait::async_trait;
use std::time::Duration;

/// Errors raised by a sink's write primitive. They are contained by the
/// router and never reach the code that emitted the record.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delivery queue is full, record dropped")]
    QueueFull,

    #[error("Sink is closed")]
    Closed,

    #[error("Sink setup failed: {0}")]
    Setup(String),

    #[error("Unsupported record for {sink}: {reason}")]
    Unsupported { sink: &'static str, reason: String },
}

/// Trait for log output destinations
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Write one formatted record
    fn write(&self, record: &FormattedRecord) -> Result<(), SinkError>;

    /// Flush any buffered records
    fn flush(&self) -> Result<(), SinkError>;

    /// Start a new output generation, if the sink supports it
    fn rotate(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Flush and release resources, waiting at most `grace`
    async fn close(&self, grace: Duration) -> Result<(), SinkError> {
        let _ = grace;
        self.flush()
    }
}
