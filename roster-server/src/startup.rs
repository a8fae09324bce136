//! Server startup and shutdown logic

use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use roster_logging::{init_logging_from_config, Logger};
use roster_web::{request_id_middleware, RequestLogger, WebError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub logger: Logger,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl FromRef<AppState> for Logger {
    fn from_ref(state: &AppState) -> Logger {
        state.logger.clone()
    }
}

/// Build the application router
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(log: RequestLogger) -> Json<Value> {
    let message = "The service is healthy";
    log.debug(message);
    Json(json!({ "message": message }))
}

async fn ready(
    State(state): State<AppState>,
    log: RequestLogger,
) -> Result<(StatusCode, Json<Value>), WebError> {
    if !state.is_ready() {
        let message = "The service is not ready";
        log.debug(message);
        return Err(WebError::service_unavailable(message));
    }

    let message = "The service is ready";
    log.debug(message);
    Ok((StatusCode::OK, Json(json!({ "message": message }))))
}

/// Server application struct
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Build every log sink. Fails on invalid logging configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let logger = init_logging_from_config(&config.logging)?;
        Ok(Self {
            config,
            state: AppState::new(logger),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.state.logger
    }

    /// Serve until a shutdown signal arrives, then flush the log sinks
    pub async fn start(self) -> Result<()> {
        let addr = self.config.bind_address;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        tracing::info!("Server listening on {}", addr);
        self.state.logger.info(format!("Server listening on {}", addr));

        let app = build_app(self.state.clone());
        let state = self.state.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            state.set_ready(false);
        })
        .await?;

        let logger = self.state.logger;
        logger.info("Server stopped, flushing logs");
        logger.router().shutdown(self.config.shutdown_grace).await;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
