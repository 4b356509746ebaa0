//! Sequential dispatch: the caller runs the handler itself.
//!
//! Simple and correct, but the accept loop cannot take the next connection
//! until the current one has been fully served.

use super::{ActiveCount, Dispatch, DispatchError};
use crate::connection::Connection;
use crate::handler::ConnectionHandler;

/// Runs each connection to completion inside `submit`.
#[derive(Debug)]
pub struct Sequential {
    handler: ConnectionHandler,
    active: ActiveCount,
}

impl Sequential {
    pub fn new() -> Self {
        Self {
            handler: ConnectionHandler::new("Single-threaded server"),
            active: ActiveCount::default(),
        }
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> Dispatch<C> for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn submit(&self, conn: C) -> Result<(), DispatchError> {
        let _active = self.active.enter();
        self.handler.handle(conn);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.active.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{written, MockConnection, Probe};
    use std::time::{Duration, Instant};

    #[test]
    fn test_submit_waits_for_handler() {
        let probe = Probe::new();
        let dispatcher = Sequential::new();
        let conn = MockConnection::new(&probe, "hello\n").with_delay(Duration::from_millis(100));
        let output = conn.output();

        let start = Instant::now();
        dispatcher.submit(conn).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(probe.closed(), 1);
        assert!(written(&output).contains("Single-threaded server"));
        assert_eq!(Dispatch::<MockConnection>::in_flight(&dispatcher), 0);
    }

    #[test]
    fn test_never_concurrent() {
        let probe = Probe::new();
        let dispatcher = Sequential::new();

        for _ in 0..5 {
            dispatcher
                .submit(MockConnection::new(&probe, "x\n").with_delay(Duration::from_millis(5)))
                .unwrap();
        }

        assert_eq!(probe.handled(), 5);
        assert_eq!(probe.closed(), 5);
        assert_eq!(probe.peak(), 1);
    }

    #[test]
    fn test_runs_on_calling_thread() {
        let probe = Probe::new();
        let conn = MockConnection::new(&probe, "where\n");
        let output = conn.output();

        std::thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || Sequential::new().submit(conn))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();

        assert!(written(&output).contains("[acceptor]"));
    }
}
