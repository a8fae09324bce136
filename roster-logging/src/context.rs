use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt::Debug;
use std::sync::Arc;

/// Ordered key/value annotations carried by records
pub type Fields = serde_json::Map<String, JsonValue>;

tokio::task_local! {
    static CURRENT_REQUEST_ID: String;
}

/// Immutable, layered context bound to a logger.
///
/// Every `bind` allocates one layer that points at its parent, so deriving a
/// child never copies or touches the ancestors. Layers are merged root to leaf
/// when a record is emitted.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    head: Option<Arc<Layer>>,
}

#[derive(Debug)]
struct Layer {
    parent: Option<Arc<Layer>>,
    fields: Fields,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context overlaid with `fields`
    pub fn bind(&self, fields: Fields) -> Self {
        if fields.is_empty() {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(Layer {
                parent: self.head.clone(),
                fields,
            })),
        }
    }

    pub fn with_field(&self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let mut fields = Fields::new();
        fields.insert(key.into(), value.into());
        self.bind(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Flatten all layers; later (child) layers win on key collision
    pub fn resolve(&self) -> Fields {
        let mut layers = Vec::new();
        let mut current = self.head.as_deref();
        while let Some(layer) = current {
            layers.push(&layer.fields);
            current = layer.parent.as_deref();
        }

        let mut merged = Fields::new();
        for fields in layers.into_iter().rev() {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Convert any serializable value to JSON, falling back to its `Debug` text
pub fn to_json_lossy<T>(value: &T) -> JsonValue
where
    T: Serialize + Debug + ?Sized,
{
    serde_json::to_value(value).unwrap_or_else(|_| JsonValue::String(format!("{:?}", value)))
}

/// Correlation id of the request currently being handled on this task, or an
/// empty string outside of a request scope.
pub fn current_request_id() -> String {
    CURRENT_REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_default()
}

/// Run a future with `request_id` as the current correlation id
pub async fn with_request_id<F, T>(request_id: impl Into<String>, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_REQUEST_ID.scope(request_id.into(), f).await
}

/// Build a [`Fields`] map
#[macro_export]
macro_rules! fields {
    () => {
        $crate::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::Fields::new();
        $(
            fields.insert(::std::string::String::from($key), $crate::context::to_json_lossy(&$value));
        )+
        fields
    }};
}
