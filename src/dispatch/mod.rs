//! Connection dispatch strategies.
//!
//! A strategy decides how and when the [`ConnectionHandler`] runs for an
//! accepted connection:
//! - `sequential`: inline on the accepting thread, one at a time
//! - `thread_per_task`: a fresh thread per connection, unbounded
//! - `pooled`: a fixed set of long-lived workers fed from a queue
//!
//! Every strategy takes ownership of the connection in `submit` and
//! guarantees it is closed exactly once, even when dispatch itself fails.

pub mod pooled;
pub mod sequential;
pub mod thread_per_task;

pub use pooled::{PoolOptions, WorkerPool};
pub use sequential::Sequential;
pub use thread_per_task::ThreadPerTask;

use crate::config::{Config, StrategyType};
use crate::connection::{self, Connection};
use crate::handler::ConnectionHandler;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Accepts ownership of connections and arranges for them to be handled.
pub trait Dispatch<C: Connection>: Send {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Hand a connection over for handling.
    ///
    /// On error the connection has already been closed.
    fn submit(&self, conn: C) -> Result<(), DispatchError>;

    /// Handlers currently running.
    fn in_flight(&self) -> usize;

    /// Connections waiting for a free execution unit.
    fn queued(&self) -> usize {
        0
    }
}

/// Build the strategy selected by the configuration.
pub fn build<C: Connection>(config: &Config) -> io::Result<Box<dyn Dispatch<C>>> {
    let dispatcher: Box<dyn Dispatch<C>> = match config.strategy {
        StrategyType::Sequential => Box::new(Sequential::new()),
        StrategyType::ThreadPerTask => Box::new(ThreadPerTask::new(config.stack_size)),
        StrategyType::Pooled => Box::new(WorkerPool::new(PoolOptions {
            size: config.pool_size,
            queue_capacity: config.queue_capacity,
            queue_policy: config.queue_policy,
            stack_size: config.stack_size,
        })?),
    };
    Ok(dispatcher)
}

/// A connection paired with the work of handling it.
///
/// Dropping a task that never ran closes its connection.
pub struct Task<C: Connection> {
    conn: Option<C>,
}

impl<C: Connection> Task<C> {
    pub fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    /// Run the handler, which takes over closing the connection.
    pub fn run(mut self, handler: &ConnectionHandler) {
        if let Some(conn) = self.conn.take() {
            handler.handle(conn);
        }
    }
}

impl<C: Connection> Drop for Task<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(peer = %conn.peer(), "Task dropped before running");
            connection::close(conn);
        }
    }
}

/// Counter of running handlers, shared with the threads running them.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveCount(Arc<AtomicUsize>);

impl ActiveCount {
    /// Count one handler as running until the guard drops.
    pub(crate) fn enter(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(Arc::clone(&self.0))
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatch errors
#[derive(Debug)]
pub enum DispatchError {
    /// The execution unit for the connection could not be created.
    Spawn(io::Error),
    /// The bounded queue is full and the policy is to reject.
    QueueFull,
    /// The strategy no longer accepts work.
    Closed,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Spawn(e) => write!(f, "Failed to spawn handler thread: {e}"),
            DispatchError::QueueFull => write!(f, "Work queue is full"),
            DispatchError::Closed => write!(f, "Dispatcher is closed"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}
