//! Connection handler.
//!
//! Protocol: one request line in, two response lines out.
//! - Read: `<text>\n` (a missing line is treated as empty)
//! - Write: `<label> [<thread>] accepted the input : <text>\n<timestamp>\n`
//!
//! The handler takes the connection by value and always closes it before
//! returning, whether the request succeeded, failed or panicked.

use crate::connection::{self, Connection};
use chrono::Local;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, trace, warn};

/// Longest request line accepted; anything beyond is ignored.
const MAX_LINE_SIZE: usize = 8 * 1024;

/// Serves one request per connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    label: &'static str,
}

impl ConnectionHandler {
    /// Create a handler whose responses are tagged with `label`.
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }

    /// Serve a single request and close the connection.
    ///
    /// Never panics or returns an error: failures are logged and the
    /// connection is abandoned.
    pub fn handle<C: Connection>(&self, mut conn: C) {
        let peer = conn.peer();

        match panic::catch_unwind(AssertUnwindSafe(|| self.respond(&mut conn))) {
            Ok(Ok(())) => trace!(peer = %peer, "Request served"),
            Ok(Err(e)) => warn!(peer = %peer, error = %e, "Request failed"),
            Err(_) => error!(peer = %peer, "Handler panicked"),
        }

        connection::close(conn);
    }

    fn respond<C: Connection>(&self, conn: &mut C) -> io::Result<()> {
        let input = read_request_line(conn)?;
        debug!(input = %input, "Received request");

        let response = format!(
            "{} [{}] accepted the input : {}\n{}\n",
            self.label,
            thread::current().name().unwrap_or("unnamed"),
            input,
            timestamp(),
        );
        conn.write_all(response.as_bytes())?;
        conn.flush()
    }
}

/// Read one newline-terminated line, without its terminator.
///
/// End of stream before any data yields an empty string.
fn read_request_line<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut reader = BufReader::new(reader.take(MAX_LINE_SIZE as u64));
    let mut line = Vec::with_capacity(64);

    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(String::new());
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }

    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Current local time in RFC 2822 form.
fn timestamp() -> String {
    Local::now().to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{written, MockConnection, Probe};
    use chrono::DateTime;
    use std::io::Cursor;

    fn lines(output: &str) -> Vec<&str> {
        output.lines().collect()
    }

    #[test]
    fn test_echo_contract() {
        let probe = Probe::new();
        let conn = MockConnection::new(&probe, "hello\n");
        let output = conn.output();

        ConnectionHandler::new("Test server").handle(conn);

        let text = written(&output);
        let lines = lines(&text);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Test server ["));
        assert!(lines[0].ends_with("accepted the input : hello"));
        assert!(DateTime::parse_from_rfc2822(lines[1]).is_ok());
        assert_eq!(probe.closed(), 1);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_empty_input() {
        let probe = Probe::new();
        let conn = MockConnection::new(&probe, "");
        let output = conn.output();

        ConnectionHandler::new("Test server").handle(conn);

        let text = written(&output);
        assert!(lines(&text)[0].ends_with("accepted the input : "));
        assert_eq!(probe.handled(), 1);
        assert_eq!(probe.closed(), 1);
    }

    #[test]
    fn test_read_failure_still_closes() {
        let probe = Probe::new();
        let conn = MockConnection::failing(&probe);
        let output = conn.output();

        ConnectionHandler::new("Test server").handle(conn);

        assert!(written(&output).is_empty());
        assert_eq!(probe.closed(), 1);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_panic_contained_and_closed() {
        let probe = Probe::new();
        ConnectionHandler::new("Test server").handle(MockConnection::panicking(&probe));
        assert_eq!(probe.closed(), 1);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_only_first_line_is_read() {
        let probe = Probe::new();
        let conn = MockConnection::new(&probe, "first\r\nsecond\n");
        let output = conn.output();

        ConnectionHandler::new("Test server").handle(conn);

        let text = written(&output);
        assert!(lines(&text)[0].ends_with(": first"));
        assert!(!text.contains("second"));
    }

    #[test]
    fn test_read_request_line() {
        let mut input = Cursor::new(b"no newline".to_vec());
        assert_eq!(read_request_line(&mut input).unwrap(), "no newline");

        let mut input = Cursor::new(b"crlf\r\n".to_vec());
        assert_eq!(read_request_line(&mut input).unwrap(), "crlf");

        let mut input = Cursor::new(Vec::new());
        assert_eq!(read_request_line(&mut input).unwrap(), "");
    }

    #[test]
    fn test_long_line_truncated() {
        let long = "x".repeat(MAX_LINE_SIZE * 2);
        let mut input = Cursor::new(long.into_bytes());
        assert_eq!(read_request_line(&mut input).unwrap().len(), MAX_LINE_SIZE);
    }
}
