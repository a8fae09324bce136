use crate::errors::WebError;
use crate::middleware::RequestId;
use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::request::Parts;
use roster_logging::{current_request_id, Logger};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::ops::Deref;

/// Logger bound with the canonical request keys.
///
/// The root logger is taken from application state, then bound with
/// `ip_address`, `method`, `path` and `request_id`. The client address is
/// empty when the server was not started with connect info.
#[derive(Debug, Clone)]
pub struct RequestLogger(pub Logger);

impl RequestLogger {
    pub fn into_inner(self) -> Logger {
        self.0
    }

    /// Log the detailed cause and return a 500 carrying only `message`
    #[track_caller]
    pub fn internal_error<E>(&self, message: &str, error: &E) -> WebError
    where
        E: StdError + 'static,
    {
        self.0.error_with_source(message, error);
        WebError::internal(message)
    }

    /// Log a warning and return a 404
    #[track_caller]
    pub fn not_found(&self, message: &str) -> WebError {
        self.0.warning(message);
        WebError::not_found(message)
    }
}

impl Deref for RequestLogger {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequestLogger
where
    Logger: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let root = Logger::from_ref(state);

        let ip_address = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(current_request_id);

        Ok(RequestLogger(root.request_scoped(
            ip_address,
            parts.method.as_str(),
            parts.uri.path(),
            request_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{request_id_middleware, REQUEST_ID_HEADER};
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::{middleware, routing::get, Router};
    use parking_lot::Mutex;
    use roster_logging::{
        EnvelopeFormat, FormattedRecord, LogSink, SinkBinding, SinkError, SinkRouter,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn write(&self, record: &FormattedRecord) -> Result<(), SinkError> {
            self.lines.lock().push(record.to_line());
            Ok(())
        }

        fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct DatabaseError;

    fn logger() -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let router = SinkRouter::builder()
            .add_binding(SinkBinding::new("memory", sink.clone()).with_format(EnvelopeFormat::aggregator()))
            .build();
        (Logger::new(Arc::new(router)), sink)
    }

    async fn list_users(log: RequestLogger) -> impl IntoResponse {
        log.info("All users shown");
        StatusCode::OK
    }

    async fn failing(log: RequestLogger) -> Result<StatusCode, WebError> {
        Err(log.internal_error("Users could not be shown", &DatabaseError))
    }

    fn app(logger: Logger) -> Router {
        Router::new()
            .route("/users", get(list_users))
            .route("/failing", get(failing))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(logger)
    }

    #[tokio::test]
    async fn test_request_keys_are_bound() {
        let (logger, sink) = logger();
        let request = axum::http::Request::builder()
            .uri("/users?page=2")
            .header(REQUEST_ID_HEADER, "abc123")
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4242))))
            .body(Body::empty())
            .unwrap();

        let response = app(logger).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let record: Value = serde_json::from_str(&sink.lines.lock()[0]).unwrap();
        assert_eq!(record["ip_address"], json!("10.0.0.1"));
        assert_eq!(record["method"], json!("GET"));
        assert_eq!(record["path"], json!("/users"));
        assert_eq!(record["request_id"], json!("abc123"));
    }

    #[tokio::test]
    async fn test_missing_connect_info_gives_empty_address() {
        let (logger, sink) = logger();
        let request = axum::http::Request::builder()
            .uri("/users")
            .body(Body::empty())
            .unwrap();

        app(logger).oneshot(request).await.unwrap();

        let record: Value = serde_json::from_str(&sink.lines.lock()[0]).unwrap();
        assert_eq!(record["ip_address"], json!(""));
        assert!(!record["request_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_internal_error_logs_cause_but_hides_it() {
        let (logger, sink) = logger();
        let request = axum::http::Request::builder()
            .uri("/failing")
            .body(Body::empty())
            .unwrap();

        let response = app(logger).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "message": "Users could not be shown" }));

        let record: Value = serde_json::from_str(&sink.lines.lock()[0]).unwrap();
        assert_eq!(record["level"], json!("ERROR"));
        assert_eq!(record["file"], json!("request_logger.rs"));
        assert_eq!(
            record["exception"][0],
            json!({ "type": "DatabaseError", "message": "connection refused" })
        );
    }
}
