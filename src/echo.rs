//! Echo application glue.
//!
//! Drained bytes are written straight back on the same nonblocking socket.
//! There is no outbound buffering: if the send buffer fills mid-response,
//! the remainder is dropped with a warning rather than queued.

use std::io::{self, Write};
use std::net::TcpStream;
use tracing::warn;

/// Write `data` back to the peer, returning the number of bytes sent.
///
/// A would-block terminates the attempt without error; a hard write error
/// propagates so the caller can close the connection.
pub fn echo_back(stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut stream = stream;
    let mut sent = 0;

    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!(
                    dropped = data.len() - sent,
                    "Send buffer full, dropping rest of echo response"
                );
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_echo_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let sent = echo_back(&server, b"hello").unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
