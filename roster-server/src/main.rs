//! Roster Server Binary

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use roster_server::{Server, ServerConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server bind address
    #[arg(short, long, default_value = "0.0.0.0:5000")]
    bind: SocketAddr,

    /// Seconds allowed for pending log deliveries at shutdown
    #[arg(long, default_value_t = 5)]
    shutdown_grace: u64,

    /// Logging configuration file (YAML); the environment is used otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Filter for the server's own diagnostics (RUST_LOG wins)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    roster_logging::init_diagnostics(&cli.log_level)?;

    // A broken logging configuration stops the process here
    let config = ServerConfig::load(
        cli.bind,
        Duration::from_secs(cli.shutdown_grace),
        cli.config.as_deref(),
    )?;

    let server = Server::new(config)?;
    server.start().await
}
