use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;

/// One link of an error's `source()` chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ExceptionEntry {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Error details attached to ERROR records, outermost error first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub chain: Vec<ExceptionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExceptionInfo {
    /// Capture a concrete error, naming the outermost link after its Rust type.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + 'static,
    {
        let mut info = Self::from_dyn(error);
        if let (Some(name), Some(first)) = (
            short_type_name(std::any::type_name::<E>()),
            info.chain.first_mut(),
        ) {
            first.error_type = name;
        }
        info
    }

    /// Capture a type-erased error. Type names are read from the `Debug`
    /// representation of each link.
    pub fn from_dyn(error: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut current: Option<&(dyn StdError + 'static)> = Some(error);

        while let Some(err) = current {
            chain.push(ExceptionEntry::new(debug_type_name(err), err.to_string()));
            current = err.source();
        }

        Self {
            chain,
            stack: capture_stack(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn innermost(&self) -> Option<&ExceptionEntry> {
        self.chain.last()
    }
}

fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn short_type_name(full: &str) -> Option<String> {
    if full.starts_with("dyn ") || full.starts_with('&') {
        return None;
    }
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn debug_type_name(error: &(dyn StdError + 'static)) -> String {
    let debug = format!("{:?}", error);
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_uppercase()) {
        "Error".to_string()
    } else {
        name
    }
}
