//! # Roster Web Utilities
//!
//! Request-level glue between axum handlers and the logging core:
//!
//! - **Middleware**: correlation id handling (`X-Request-ID`)
//! - **Extractors**: a request-scoped [`RequestLogger`]
//! - **Errors**: [`WebError`] with stable JSON bodies
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{middleware, routing::get, Router};
//! use roster_logging::{init_logging_from_config, LoggingConfig, Logger};
//! use roster_web::{request_id_middleware, RequestLogger};
//!
//! async fn health(log: RequestLogger) -> &'static str {
//!     log.debug("The service is healthy");
//!     "ok"
//! }
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let logger: Logger = init_logging_from_config(&LoggingConfig::default())?;
//! let app: Router = Router::new()
//!     .route("/health", get(health))
//!     .layer(middleware::from_fn(request_id_middleware))
//!     .with_state(logger);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod extractors;
pub mod middleware;

// Re-export commonly used types and functions
pub use errors::{WebError, WebResult};
pub use extractors::RequestLogger;
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
