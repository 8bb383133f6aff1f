//! echoplex: a nonblocking TCP echo server with selectable trigger modes.
//!
//! One dispatch thread blocks on epoll and routes readiness events.
//! Connections are serviced under one of three triggering disciplines:
//! - level: one recv per event, unread data re-signals
//! - edge: one delivery per readable transition, drained to would-block
//! - edge-oneshot: edge draining offloaded to a worker pool, with the
//!   descriptor disarmed until the worker re-arms it
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod dispatch;
mod echo;

use config::{Config, ConfigError};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::MissingAddress) => {
            eprintln!("usage: echoplex <host> <port>");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        mode = ?config.mode,
        workers = config.workers,
        max_connections = config.max_connections,
        "Starting echoplex server"
    );

    // The loop runs until the readiness wait fails; that failure is logged
    // inside the dispatcher and falls through to an orderly teardown.
    if let Err(e) = dispatch::run(config) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
