//! Accepted connections as seen by the dispatch layer.
//!
//! A [`Connection`] is a bidirectional byte stream with an explicit close.
//! `close` consumes the connection, so whoever holds it by value is the one
//! that must close it, and it can only happen once.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use tracing::{debug, warn};

/// A single accepted stream with read and write sides.
pub trait Connection: Read + Write + Send + 'static {
    /// Human-readable identity of the remote end, used in logs.
    fn peer(&self) -> String;

    /// Close both directions of the stream.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

impl Connection for TcpStream {
    fn peer(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "unknown".to_string(),
        }
    }

    fn close(self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already tore the stream down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Close a connection, logging the outcome. Close failures are never fatal.
pub fn close<C: Connection>(conn: C) {
    let peer = conn.peer();
    match conn.close() {
        Ok(()) => debug!(peer = %peer, "Closed connection"),
        Err(e) => warn!(peer = %peer, error = %e, "Failed to close connection"),
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockConnection, Probe};
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_close_counts_once() {
        let probe = Probe::new();
        let conn = MockConnection::new(&probe, "hi\n");
        close(conn);
        assert_eq!(probe.closed(), 1);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_tcp_close_after_peer_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        assert_eq!(server_side.peer(), client.local_addr().unwrap().to_string());
        drop(client);
        assert!(server_side.close().is_ok());
    }
}
