//! Policy-parameterized drain routine.
//!
//! One readiness delivery corresponds to one drain pass. How much the pass
//! reads depends on the trigger mode: level triggering gets re-signaled
//! while data remains, so one recv attempt suffices; edge triggering is
//! delivered once per transition, so the pass must loop until would-block
//! or unread bytes go silently stale.

use crate::dispatch::registry::TriggerMode;
use bytes::BytesMut;
use std::io::{self, Read};
use std::net::TcpStream;

/// How a drain pass ended.
#[derive(Debug)]
pub enum DrainStatus {
    /// No more data right now; the connection stays open.
    WouldBlock,
    /// Zero-length read: the peer closed the connection.
    PeerClosed,
    /// Hard I/O error; the connection must be closed.
    Error(io::Error),
}

/// Outcome of a single drain pass: everything read plus how it ended.
#[derive(Debug)]
pub struct DrainPass {
    pub data: BytesMut,
    pub status: DrainStatus,
}

impl DrainPass {
    /// The connection survives this pass and awaits the next delivery.
    pub fn keeps_connection(&self) -> bool {
        matches!(self.status, DrainStatus::WouldBlock)
    }
}

/// Drain a nonblocking stream according to the trigger mode.
///
/// A zero-length read stops the pass immediately, even mid-loop: the
/// descriptor has signaled closed and must not be read again.
pub fn drain(stream: &TcpStream, mode: TriggerMode, buffer_size: usize) -> DrainPass {
    let mut data = BytesMut::new();
    // A read into an empty buffer returns Ok(0), indistinguishable from
    // the peer closing, so the chunk is never zero-sized
    let mut chunk = vec![0u8; buffer_size.max(1)];
    let mut stream = stream;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => {
                return DrainPass {
                    data,
                    status: DrainStatus::PeerClosed,
                };
            }
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                if !mode.drains_fully() {
                    // Level triggering: unread bytes re-signal on the next
                    // wait call, so one successful recv per event is enough.
                    return DrainPass {
                        data,
                        status: DrainStatus::WouldBlock,
                    };
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return DrainPass {
                    data,
                    status: DrainStatus::WouldBlock,
                };
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return DrainPass {
                    data,
                    status: DrainStatus::Error(e),
                };
            }
        }
    }
}
