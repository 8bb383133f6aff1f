//! Listener acceptor.
//!
//! Accepts in a loop until would-block. Under edge triggering the
//! listener's readiness is delivered once per transition, so a burst of
//! simultaneous inbound connections must all be accepted on that one
//! delivery or they sit in the backlog until some unrelated event fires.

use crate::dispatch::connection::{Connection, ConnectionTable};
use crate::dispatch::registry::{EpollRegistry, TriggerMode};
use std::io;
use std::net::TcpListener;
use tracing::{debug, error, warn};

/// Drain the accept queue, registering each new connection under the
/// dispatcher's configured trigger mode.
///
/// Accept failures never abort the dispatch loop: would-block ends the
/// pass, anything else is logged and ends it too.
pub fn accept_ready(
    listener: &TcpListener,
    registry: &EpollRegistry,
    table: &mut ConnectionTable,
    mode: TriggerMode,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn = Connection::new(stream, mode, peer);
                let token = match table.insert(conn) {
                    Some(token) => token,
                    None => {
                        // Dropping the stream closes the descriptor
                        warn!(%peer, "Connection limit reached, rejecting");
                        continue;
                    }
                };

                let conn = table.get_mut(token).expect("just inserted");
                if let Err(e) = registry.register(conn.fd(), token, mode) {
                    error!(%peer, error = %e, "Failed to register connection");
                    table.remove(token);
                    continue;
                }

                debug!(token, %peer, ?mode, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}
