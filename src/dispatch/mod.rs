//! Readiness dispatch core.
//!
//! - `registry`: epoll handle; register/rearm/unregister/wait
//! - `drain`: trigger-mode-parameterized nonblocking read loop
//! - `connection`: per-connection state machine and slab table
//! - `acceptor`: accept-until-would-block and registration
//! - `workers`: drain worker pool for oneshot mode
//! - `executor`: the dispatch loop tying it all together

mod acceptor;
mod connection;
mod drain;
mod executor;
mod registry;
mod workers;

pub use executor::Dispatcher;

use crate::config::Config;

/// Build a dispatcher from the resolved config and run it until the
/// readiness wait fails.
pub fn run(config: Config) -> std::io::Result<()> {
    Dispatcher::new(&config)?.run()
}
