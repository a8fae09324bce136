//! Roster server
//!
//! Composition root: reads configuration, builds the sink router once, mounts
//! the probe routes and flushes the log sinks within a bounded grace period
//! on shutdown.

pub mod config;
pub mod startup;

// Re-export main components
pub use config::ServerConfig;
pub use startup::{build_app, AppState, Server};
