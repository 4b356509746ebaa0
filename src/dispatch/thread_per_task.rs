//! Thread-per-task dispatch: every connection gets a new thread.
//!
//! Removes head-of-line blocking from the accept loop, but there is no
//! upper bound on threads and no reuse. Under a sustained arrival rate the
//! process eventually fails to create threads; that failure is reported per
//! connection and the connection is closed.

use super::{ActiveCount, Dispatch, DispatchError, Task};
use crate::connection::Connection;
use crate::handler::ConnectionHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::trace;

/// Spawns one detached thread per submitted connection.
#[derive(Debug)]
pub struct ThreadPerTask {
    handler: ConnectionHandler,
    active: ActiveCount,
    stack_size: Option<usize>,
    spawned: AtomicU64,
}

impl ThreadPerTask {
    /// Create the strategy; `stack_size` applies to every spawned thread.
    pub fn new(stack_size: Option<usize>) -> Self {
        Self {
            handler: ConnectionHandler::new("New server thread"),
            active: ActiveCount::default(),
            stack_size,
            spawned: AtomicU64::new(0),
        }
    }
}

impl<C: Connection> Dispatch<C> for ThreadPerTask {
    fn name(&self) -> &'static str {
        "thread-per-task"
    }

    fn submit(&self, conn: C) -> Result<(), DispatchError> {
        let task = Task::new(conn);
        let handler = self.handler.clone();
        let active = self.active.enter();
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed);

        let mut builder = thread::Builder::new().name(format!("conn-{seq}"));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        // On failure the closure is dropped, which releases `active` and
        // closes the connection through the task.
        builder
            .spawn(move || {
                let _active = active;
                task.run(&handler);
            })
            .map_err(DispatchError::Spawn)?;

        trace!(thread = seq, "Spawned connection thread");
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.active.get()
    }
}
