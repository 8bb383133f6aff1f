//! Connection state machine and table.
//!
//! Each connection tracks where it is in the dispatch lifecycle:
//! armed and awaiting readiness, mid-drain (held by exactly one reader),
//! or closed. The table is slab-allocated; the slab key doubles as the
//! epoll token for the connection's descriptor.

use crate::dispatch::registry::TriggerMode;
use slab::Slab;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

/// Lifecycle state of a connection.
///
/// `Registered { armed: false }` only occurs under oneshot triggering,
/// between event delivery and the drain being picked up. Re-entry to
/// `Registered` happens only from `Draining` via an explicit re-arm,
/// never from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Enrolled in the registry; `armed` says whether the next readable
    /// transition will be delivered.
    Registered { armed: bool },
    /// One execution context is draining the descriptor.
    Draining,
    /// Terminal. The descriptor is gone from the interest table.
    Closed,
}

/// A single accepted connection.
///
/// The stream is held behind `Arc` so that in offloaded mode a worker can
/// service it while the table entry (and thus the descriptor's lifetime)
/// stays with the dispatch thread.
#[derive(Debug)]
pub struct Connection {
    stream: Arc<TcpStream>,
    pub mode: TriggerMode,
    pub state: ConnState,
    pub peer: SocketAddr,
}

impl Connection {
    /// Create a connection in the armed registered state.
    pub fn new(stream: TcpStream, mode: TriggerMode, peer: SocketAddr) -> Self {
        Self {
            stream: Arc::new(stream),
            mode,
            state: ConnState::Registered { armed: true },
            peer,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    /// A readiness delivery disarmed the descriptor and a reader took
    /// ownership of servicing it.
    pub fn begin_drain(&mut self) {
        debug_assert_eq!(self.state, ConnState::Registered { armed: true });
        self.state = ConnState::Draining;
    }

    /// The drain pass finished and interest was restored.
    pub fn rearmed(&mut self) {
        debug_assert_ne!(self.state, ConnState::Closed);
        self.state = ConnState::Registered { armed: true };
    }

    /// Terminal transition.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

/// Table of active connections with O(1) insert, lookup, and remove.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection, returning its token.
    ///
    /// Returns `None` if the table is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, token: usize) -> Option<&mut Connection> {
        self.connections.get_mut(token)
    }

    /// Remove a connection; dropping the returned entry closes the
    /// descriptor once no worker still holds a stream handle.
    pub fn remove(&mut self, token: usize) -> Option<Connection> {
        if self.connections.contains(token) {
            Some(self.connections.remove(token))
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn contains(&self, token: usize) -> bool {
        self.connections.contains(token)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_conn(mode: TriggerMode) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        Connection::new(stream, mode, addr)
    }

    #[test]
    fn test_state_transitions() {
        let mut conn = test_conn(TriggerMode::EdgeOneshot);
        assert_eq!(conn.state, ConnState::Registered { armed: true });

        conn.begin_drain();
        assert_eq!(conn.state, ConnState::Draining);

        conn.rearmed();
        assert_eq!(conn.state, ConnState::Registered { armed: true });

        conn.begin_drain();
        conn.close();
        assert_eq!(conn.state, ConnState::Closed);
    }

    #[test]
    fn test_table_capacity() {
        let mut table = ConnectionTable::new(2);

        let t1 = table.insert(test_conn(TriggerMode::Level)).unwrap();
        let t2 = table.insert(test_conn(TriggerMode::Level)).unwrap();
        assert!(table.insert(test_conn(TriggerMode::Level)).is_none());

        assert_eq!(table.len(), 2);
        assert!(table.contains(t1));

        table.remove(t1);
        assert!(!table.contains(t1));
        assert!(table.contains(t2));
        assert_eq!(table.len(), 1);
    }
}
