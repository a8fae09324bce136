use crate::config::LoggingConfig;
use crate::logger::Logger;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the diagnostics subscriber used for the pipeline's own warnings.
///
/// Diagnostics are JSON lines on stderr, so the stream stays machine-readable
/// next to the ERROR envelopes written there. `RUST_LOG` takes precedence
/// over `level`.
pub fn init_diagnostics(level: &str) -> Result<()> {
    // Use try_init to avoid panic if global subscriber already set
    if diagnostics_subscriber(level, std::io::stderr).try_init().is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

fn diagnostics_subscriber<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .with_target(false)
        .finish()
}

/// Validate the configuration, build every sink and return the root logger
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<Logger> {
    config.validate().context("Invalid logging configuration")?;

    let router = config
        .build_router()
        .context("Failed to build log sinks")?;

    tracing::info!(
        bindings = router.bindings().len(),
        debug = config.debug,
        remote = config.remote.is_some(),
        "Logging pipeline initialized"
    );

    Ok(Logger::new(Arc::new(router)))
}
