use crate::context::{current_request_id, Fields, LogContext};
use crate::error_info::ExceptionInfo;
use crate::event::{LogEvent, LogLevel, SourceLocation};
use crate::router::SinkRouter;
use serde_json::Value as JsonValue;
use std::error::Error as StdError;
use std::sync::Arc;

/// Cheap, cloneable logging handle.
///
/// A handle pairs an immutable context with the shared router. `bind` returns
/// a new handle and leaves the receiver untouched, so request-scoped handles
/// can be derived from the root and dropped at the end of the request.
#[derive(Clone)]
pub struct Logger {
    context: LogContext,
    router: Arc<SinkRouter>,
}

impl Logger {
    pub fn new(router: Arc<SinkRouter>) -> Self {
        Self {
            context: LogContext::new(),
            router,
        }
    }

    pub fn router(&self) -> &Arc<SinkRouter> {
        &self.router
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    /// Derive a handle carrying additional context
    pub fn bind(&self, fields: Fields) -> Logger {
        Logger {
            context: self.context.bind(fields),
            router: self.router.clone(),
        }
    }

    pub fn bind_field(&self, key: impl Into<String>, value: impl Into<JsonValue>) -> Logger {
        Logger {
            context: self.context.with_field(key, value),
            router: self.router.clone(),
        }
    }

    /// Bind the canonical request keys
    pub fn request_scoped(
        &self,
        ip_address: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Logger {
        let mut fields = Fields::new();
        fields.insert("ip_address".into(), JsonValue::String(ip_address.into()));
        fields.insert("method".into(), JsonValue::String(method.into()));
        fields.insert("path".into(), JsonValue::String(path.into()));
        fields.insert("request_id".into(), JsonValue::String(request_id.into()));
        self.bind(fields)
    }

    #[track_caller]
    pub fn log(&self, level: LogLevel, message: impl Into<String>, extra: Fields) {
        self.emit(level, message.into(), extra, None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message.into(), Fields::new(), None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message.into(), Fields::new(), None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message.into(), Fields::new(), None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message.into(), Fields::new(), None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn debug_with(&self, message: impl Into<String>, extra: Fields) {
        self.emit(LogLevel::Debug, message.into(), extra, None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn info_with(&self, message: impl Into<String>, extra: Fields) {
        self.emit(LogLevel::Info, message.into(), extra, None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn warning_with(&self, message: impl Into<String>, extra: Fields) {
        self.emit(LogLevel::Warning, message.into(), extra, None, SourceLocation::caller());
    }

    #[track_caller]
    pub fn error_with(&self, message: impl Into<String>, extra: Fields) {
        self.emit(LogLevel::Error, message.into(), extra, None, SourceLocation::caller());
    }

    /// Log an error together with the error value that caused it
    #[track_caller]
    pub fn error_with_source<E>(&self, message: impl Into<String>, error: &E)
    where
        E: StdError + 'static,
    {
        let exception = ExceptionInfo::from_error(error);
        self.emit(
            LogLevel::Error,
            message.into(),
            Fields::new(),
            Some(exception),
            SourceLocation::caller(),
        );
    }

    /// Like [`Logger::error_with_source`] for type-erased errors
    #[track_caller]
    pub fn error_with_dyn_source(&self, message: impl Into<String>, error: &(dyn StdError + 'static)) {
        let exception = ExceptionInfo::from_dyn(error);
        self.emit(
            LogLevel::Error,
            message.into(),
            Fields::new(),
            Some(exception),
            SourceLocation::caller(),
        );
    }

    fn emit(
        &self,
        level: LogLevel,
        message: String,
        extra: Fields,
        exception: Option<ExceptionInfo>,
        location: SourceLocation,
    ) {
        // Skip building the record when no binding would take it
        match self.router.min_level() {
            Some(min_level) if level >= min_level => {}
            _ => return,
        }

        let mut fields = self.context.resolve();
        for (key, value) in extra {
            fields.insert(key, value);
        }
        if !fields.contains_key("request_id") {
            let request_id = current_request_id();
            if !request_id.is_empty() {
                fields.insert("request_id".to_string(), JsonValue::String(request_id));
            }
        }

        let mut event = LogEvent::new(level, message)
            .with_fields(fields)
            .with_location(location);
        if let Some(exception) = exception {
            event = event.with_exception(exception);
        }

        self.router.dispatch(&event);
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("context", &self.context.resolve())
            .field("bindings", &self.router.bindings().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::formatter::{EnvelopeFormat, FormattedRecord};
    use crate::router::SinkBinding;
    use crate::sinks::{LogSink, SinkError};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<FormattedRecord>>,
    }

    impl MemorySink {
        fn objects(&self) -> Vec<serde_json::Map<String, JsonValue>> {
            self.records
                .lock()
                .iter()
                .map(|record| serde_json::from_str(&record.to_line()).unwrap())
                .collect()
        }
    }

    impl LogSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn write(&self, record: &FormattedRecord) -> Result<(), SinkError> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn aggregator_logger() -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let router = SinkRouter::builder()
            .add_binding(SinkBinding::new("memory", sink.clone()).with_format(EnvelopeFormat::aggregator()))
            .build();
        (Logger::new(Arc::new(router)), sink)
    }

    #[test]
    fn test_parent_never_sees_child_fields() {
        let (root, sink) = aggregator_logger();
        let parent = root.bind(fields! { "service" => "roster" });
        let child = parent.bind_field("request_id", "abc123");

        child.info("from child");
        parent.info("from parent");

        let objects = sink.objects();
        assert_eq!(objects[0]["request_id"], json!("abc123"));
        assert!(!objects[1].contains_key("request_id"));
        assert_eq!(objects[1]["service"], json!("roster"));
    }

    #[test]
    fn test_extra_fields_win() {
        let (root, sink) = aggregator_logger();
        let logger = root.bind(fields! { "user_id" => 1 });

        logger.info_with("updated", fields! { "user_id" => 2 });

        assert_eq!(sink.objects()[0]["user_id"], json!(2));
    }

    #[test]
    fn test_request_scoped_keys() {
        let (root, sink) = aggregator_logger();
        root.request_scoped("10.0.0.1", "GET", "/users", "abc123")
            .warning("User not found");

        let object = &sink.objects()[0];
        assert_eq!(object["ip_address"], json!("10.0.0.1"));
        assert_eq!(object["method"], json!("GET"));
        assert_eq!(object["path"], json!("/users"));
        assert_eq!(object["request_id"], json!("abc123"));
        assert_eq!(object["level"], json!("WARNING"));
    }

    #[test]
    fn test_error_records_call_site() {
        let (root, sink) = aggregator_logger();
        root.error_with_source("boom", &std::fmt::Error);

        let object = &sink.objects()[0];
        assert_eq!(object["file"], json!("logger.rs"));
        assert!(object["line"].as_u64().unwrap() > 0);
        assert_eq!(object["exception"][0]["message"], json!("an error occurred when formatting an argument"));
    }

    #[tokio::test]
    async fn test_task_request_id_fills_missing_key() {
        let (root, sink) = aggregator_logger();

        crate::context::with_request_id("req-7", async {
            root.info("inside request");
            root.bind_field("request_id", "explicit").info("bound wins");
        })
        .await;
        root.info("outside request");

        let objects = sink.objects();
        assert_eq!(objects[0]["request_id"], json!("req-7"));
        assert_eq!(objects[1]["request_id"], json!("explicit"));
        assert!(!objects[2].contains_key("request_id"));
    }

    #[test]
    fn test_records_below_every_threshold_are_skipped() {
        let sink = Arc::new(MemorySink::default());
        let router = SinkRouter::builder()
            .add_binding(SinkBinding::new("memory", sink.clone()).with_min_level(LogLevel::Warning))
            .build();
        let logger = Logger::new(Arc::new(router));

        logger.debug("quiet");
        logger.info("quiet");
        logger.warning("loud");

        assert_eq!(sink.records.lock().len(), 1);
    }
}
