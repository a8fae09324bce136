use crate::event::{LogEvent, LogLevel};
use crate::formatter::EnvelopeFormat;
use crate::sinks::{LogSink, SinkError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Inclusion predicate evaluated after the severity threshold
#[derive(Clone)]
pub enum RecordFilter {
    All,
    /// DEBUG, INFO and WARNING: the standard output channel
    BelowError,
    /// ERROR: the standard error channel
    AtOrAboveError,
    Custom(Arc<dyn Fn(&LogEvent) -> bool + Send + Sync>),
}

impl RecordFilter {
    pub fn custom<F>(filter: F) -> Self
    where
        F: Fn(&LogEvent) -> bool + Send + Sync + 'static,
    {
        RecordFilter::Custom(Arc::new(filter))
    }

    pub fn accepts(&self, event: &LogEvent) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::BelowError => below_error_threshold(event),
            RecordFilter::AtOrAboveError => at_or_above_error_threshold(event),
            RecordFilter::Custom(filter) => filter(event),
        }
    }
}

impl fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFilter::All => f.write_str("All"),
            RecordFilter::BelowError => f.write_str("BelowError"),
            RecordFilter::AtOrAboveError => f.write_str("AtOrAboveError"),
            RecordFilter::Custom(_) => f.write_str("Custom"),
        }
    }
}

pub fn below_error_threshold(event: &LogEvent) -> bool {
    event.level() < LogLevel::Error
}

pub fn at_or_above_error_threshold(event: &LogEvent) -> bool {
    event.level() >= LogLevel::Error
}

/// A sink paired with its threshold, filter and envelope format
pub struct SinkBinding {
    name: String,
    sink: Arc<dyn LogSink>,
    min_level: LogLevel,
    filter: RecordFilter,
    format: EnvelopeFormat,
    stats: BindingStats,
}

impl SinkBinding {
    pub fn new(name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            min_level: LogLevel::Debug,
            filter: RecordFilter::All,
            format: EnvelopeFormat::local(),
            stats: BindingStats::default(),
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_format(mut self, format: EnvelopeFormat) -> Self {
        self.format = format;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub fn stats(&self) -> &BindingStats {
        &self.stats
    }

    /// Threshold and filter check
    pub fn accepts(&self, event: &LogEvent) -> bool {
        event.should_log(self.min_level) && self.filter.accepts(event)
    }
}

/// Per-binding counters
#[derive(Debug, Default)]
pub struct BindingStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl BindingStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Process-wide fan-out of records to independent sink bindings.
///
/// The binding set is fixed at construction. A failing binding is counted and
/// reported but never stops evaluation of the bindings after it.
pub struct SinkRouter {
    bindings: Vec<SinkBinding>,
}

impl SinkRouter {
    pub fn builder() -> SinkRouterBuilder {
        SinkRouterBuilder::new()
    }

    pub fn bindings(&self) -> &[SinkBinding] {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&SinkBinding> {
        self.bindings.iter().find(|binding| binding.name == name)
    }

    /// Lowest threshold across all bindings; records below it go nowhere
    pub fn min_level(&self) -> Option<LogLevel> {
        self.bindings.iter().map(|binding| binding.min_level).min()
    }

    pub fn dispatch(&self, event: &LogEvent) {
        for binding in &self.bindings {
            if !binding.accepts(event) {
                continue;
            }

            let formatted = binding.format.format(event);
            match binding.sink.write(&formatted) {
                Ok(()) => {
                    binding.stats.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    let failures = binding.stats.failed.fetch_add(1, Ordering::Relaxed) + 1;
                    if should_report(&error, failures) {
                        tracing::warn!(
                            binding = %binding.name,
                            sink = binding.sink.name(),
                            failures,
                            error = %error,
                            "Log sink write failed"
                        );
                    }
                }
            }
        }
    }

    pub fn flush(&self) {
        for binding in &self.bindings {
            if let Err(error) = binding.sink.flush() {
                tracing::warn!(binding = %binding.name, error = %error, "Log sink flush failed");
            }
        }
    }

    /// Rotate every sink that supports it
    pub fn rotate(&self) {
        for binding in &self.bindings {
            if let Err(error) = binding.sink.rotate() {
                tracing::warn!(binding = %binding.name, error = %error, "Log sink rotation failed");
            }
        }
    }

    /// Flush and close every sink, sharing one grace period between them
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;

        for binding in &self.bindings {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(error) = binding.sink.close(remaining).await {
                tracing::warn!(binding = %binding.name, error = %error, "Log sink close failed");
            }
        }
    }
}

/// A full queue fails every write during an outage; those are only reported
/// when the failure count reaches a power of two.
fn should_report(error: &SinkError, failures: u64) -> bool {
    match error {
        SinkError::QueueFull => failures.is_power_of_two(),
        _ => true,
    }
}

/// Builder for the router's binding set
#[derive(Default)]
pub struct SinkRouterBuilder {
    bindings: Vec<SinkBinding>,
}

impl SinkRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(mut self, binding: SinkBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn build(self) -> SinkRouter {
        SinkRouter {
            bindings: self.bindings,
        }
    }
}
