//! Record serialization into the local and aggregator envelopes

use crate::context::Fields;
use crate::event::LogEvent;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

/// Context keys surfaced in the local envelope when no allow-list is configured
pub const DEFAULT_ALLOWED_FIELDS: [&str; 5] =
    ["ip_address", "method", "path", "request_id", "user_id"];

/// Reserved context key whose mapping value is sent as aggregator labels
pub const METADATA_KEY: &str = "loki_metadata";

/// Internal marker key that never reaches the aggregator body
pub const SERIALIZED_MARKER_KEY: &str = "serialized";

/// Label set attached to an aggregator delivery
pub type Labels = BTreeMap<String, String>;

/// Output of a formatter, handed to a sink's write primitive
#[derive(Debug, Clone, PartialEq)]
pub enum FormattedRecord {
    /// A single JSON line, without trailing newline
    Line(String),
    /// Structured payload for the remote aggregator
    Entry(AggregatorEntry),
}

impl FormattedRecord {
    /// Render as a single line regardless of variant
    pub fn to_line(&self) -> String {
        match self {
            FormattedRecord::Line(line) => line.clone(),
            FormattedRecord::Entry(entry) => render_object(&entry.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub body: Fields,
    pub labels: Labels,
}

/// Envelope shape selected per binding at startup
#[derive(Debug, Clone)]
pub enum EnvelopeFormat {
    Local(LocalEnvelope),
    Aggregator(AggregatorEnvelope),
}

impl EnvelopeFormat {
    pub fn local() -> Self {
        EnvelopeFormat::Local(LocalEnvelope::default())
    }

    pub fn aggregator() -> Self {
        EnvelopeFormat::Aggregator(AggregatorEnvelope)
    }

    pub fn format(&self, event: &LogEvent) -> FormattedRecord {
        match self {
            EnvelopeFormat::Local(local) => FormattedRecord::Line(local.format(event)),
            EnvelopeFormat::Aggregator(aggregator) => {
                FormattedRecord::Entry(aggregator.format(event))
            }
        }
    }
}

/// Flat JSON line for console and file sinks. Only allow-listed context keys
/// are copied; everything else is dropped.
#[derive(Debug, Clone)]
pub struct LocalEnvelope {
    allowed_fields: Vec<String>,
}

impl Default for LocalEnvelope {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_FIELDS.iter().map(|k| k.to_string()).collect())
    }
}

impl LocalEnvelope {
    pub fn new(allowed_fields: Vec<String>) -> Self {
        Self { allowed_fields }
    }

    pub fn allowed_fields(&self) -> &[String] {
        &self.allowed_fields
    }

    pub fn to_object(&self, event: &LogEvent) -> Fields {
        let mut subset = Fields::new();
        subset.insert("timestamp".into(), json!(format_timestamp(event.timestamp())));
        subset.insert("level".into(), json!(event.level().as_str()));
        subset.insert("message".into(), json!(event.message()));

        for key in &self.allowed_fields {
            if let Some(value) = event.fields().get(key) {
                subset.insert(key.clone(), value.clone());
            }
        }
        subset
    }

    pub fn format(&self, event: &LogEvent) -> String {
        render_object(&self.to_object(event))
    }
}

/// Enriched envelope for the remote aggregator
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatorEnvelope;

impl AggregatorEnvelope {
    pub fn format(&self, event: &LogEvent) -> AggregatorEntry {
        let level = event.level().as_str().to_uppercase();

        let mut body = Fields::new();
        body.insert("timestamp".into(), json!(format_timestamp(event.timestamp())));
        body.insert("level".into(), json!(level));
        body.insert("message".into(), json!(event.message()));

        let mut labels = Labels::new();
        for (key, value) in event.fields() {
            match key.as_str() {
                SERIALIZED_MARKER_KEY => {}
                METADATA_KEY => labels = extract_labels(value),
                _ => {
                    body.insert(key.clone(), value.clone());
                }
            }
        }

        if event.level().is_error() {
            if let Some(location) = event.location() {
                body.insert("file".into(), json!(location.file));
                body.insert("path".into(), json!(location.path));
                body.insert("line".into(), json!(location.line));
            }
            if let Some(exception) = event.exception() {
                body.insert(
                    "exception".into(),
                    serde_json::to_value(&exception.chain).unwrap_or(JsonValue::Null),
                );
                if let Some(stack) = &exception.stack {
                    body.insert("stack".into(), json!(stack));
                }
            }
        }

        AggregatorEntry {
            timestamp: event.timestamp(),
            level,
            body,
            labels,
        }
    }
}

/// Labels from a reserved metadata value. Anything but a mapping counts as
/// no metadata at all.
fn extract_labels(value: &JsonValue) -> Labels {
    match value {
        JsonValue::Object(map) => map
            .iter()
            .filter_map(|(key, value)| {
                let name = label_name(key)?;
                let value = match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                };
                Some((name, value))
            })
            .collect(),
        _ => Labels::new(),
    }
}

/// Map a key onto `[a-zA-Z_][a-zA-Z0-9_]*`, the label names the aggregator accepts
fn label_name(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }

    let mut name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    Some(name)
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Serialize an object to one line. Falls back to a hand-built line that only
/// carries the envelope's leading string keys.
pub fn render_object(object: &Fields) -> String {
    serde_json::to_string(object).unwrap_or_else(|_| {
        let pairs: Vec<String> = ["timestamp", "level", "message"]
            .iter()
            .filter_map(|key| {
                object
                    .get(*key)
                    .map(|value| format!("{:?}:{:?}", key, value.as_str().unwrap_or_default()))
            })
            .collect();
        format!("{{{}}}", pairs.join(","))
    })
}
