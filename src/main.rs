//! hexlisten: a TCP listener that logs whatever clients send.
//!
//! Every accepted connection is serviced by its own thread, which logs each
//! received chunk as text and as an uppercase hex dump. Nothing is sent back.
//!
//! Features:
//! - Fixed connection capacity; extra connections are closed on accept
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded drain
//! - Configuration via CLI arguments or TOML file
//! - Optional log file instead of stdout

mod config;
mod hexdump;
mod registry;
mod server;
mod signal;
mod worker;

use config::Config;
use server::Server;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config)?;

    info!(
        address = %config.listen_addr(),
        max_connections = config.max_connections,
        accept_errors = ?config.accept_errors,
        drain_timeout = config.drain_timeout_secs,
        "Starting hexlisten"
    );

    let server = Server::bind(&config).map_err(|e| {
        error!(error = %e, "Server setup failed");
        e
    })?;

    signal::install_signal_handler(server.shutdown_handle())?;

    server.run().map_err(|e| {
        error!(error = %e, "Server stopped on fatal error");
        e
    })?;

    Ok(())
}

/// Initialize logging to stdout, or to the configured log file.
fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    match config.log_file {
        Some(ref path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }

    Ok(())
}
