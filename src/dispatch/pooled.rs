//! Pooled dispatch: a fixed set of long-lived workers fed from a queue.
//!
//! Submission only enqueues a [`Task`]; creating the connection's execution
//! unit is decoupled from accepting it. Pool size is fixed at construction.
//!
//! ## Queue modes
//!
//! - Unbounded (default): `submit` never blocks and the queue can grow
//!   without limit when arrivals outpace the workers.
//! - Bounded with `block`: `submit` waits for space, pushing back on the
//!   accept loop.
//! - Bounded with `reject`: `submit` fails with `QueueFull` and the
//!   connection is closed.
//!
//! Dropping the pool closes the queue; workers finish everything already
//! queued and are joined.

use super::{ActiveCount, Dispatch, DispatchError, Task};
use crate::config::QueuePolicy;
use crate::connection::Connection;
use crate::handler::ConnectionHandler;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Worker pool construction options.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Number of worker threads.
    pub size: usize,
    /// Queue bound, or `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
    /// Behaviour of a full bounded queue.
    pub queue_policy: QueuePolicy,
    /// Stack size for worker threads.
    pub stack_size: Option<usize>,
}

enum Queue<C: Connection> {
    Unbounded(Sender<Task<C>>),
    Bounded {
        sender: SyncSender<Task<C>>,
        policy: QueuePolicy,
    },
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

/// Fixed-size pool of workers pulling tasks from a shared queue.
pub struct WorkerPool<C: Connection> {
    queue: Option<Queue<C>>,
    workers: Vec<Worker>,
    active: ActiveCount,
    pending: Arc<AtomicUsize>,
}

impl<C: Connection> WorkerPool<C> {
    /// Start `options.size` workers.
    pub fn new(options: PoolOptions) -> io::Result<Self> {
        if options.size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker",
            ));
        }

        let (queue, receiver) = match options.queue_capacity {
            None => {
                let (sender, receiver) = mpsc::channel();
                (Queue::Unbounded(sender), receiver)
            }
            Some(capacity) => {
                let (sender, receiver) = mpsc::sync_channel(capacity);
                let policy = options.queue_policy;
                (Queue::Bounded { sender, policy }, receiver)
            }
        };

        let receiver = Arc::new(Mutex::new(receiver));
        let handler = ConnectionHandler::new("Task execution server thread");
        let active = ActiveCount::default();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(options.size);
        for id in 0..options.size {
            let receiver = Arc::clone(&receiver);
            let handler = handler.clone();
            let active = active.clone();
            let pending = Arc::clone(&pending);

            let mut builder = thread::Builder::new().name(format!("worker-{id}"));
            if let Some(size) = options.stack_size {
                builder = builder.stack_size(size);
            }
            let thread =
                builder.spawn(move || worker_loop(id, receiver, handler, active, pending))?;

            workers.push(Worker {
                id,
                thread: Some(thread),
            });
        }

        info!(
            workers = options.size,
            queue_capacity = ?options.queue_capacity,
            queue_policy = ?options.queue_policy,
            "Worker pool started"
        );

        Ok(Self {
            queue: Some(queue),
            workers,
            active,
            pending,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl<C: Connection> Dispatch<C> for WorkerPool<C> {
    fn name(&self) -> &'static str {
        "pooled"
    }

    fn submit(&self, conn: C) -> Result<(), DispatchError> {
        let task = Task::new(conn);
        let queue = self.queue.as_ref().ok_or(DispatchError::Closed)?;

        // Counted before sending so a fast worker never sees it negative.
        self.pending.fetch_add(1, Ordering::SeqCst);
        let result = match queue {
            Queue::Unbounded(sender) => sender.send(task).map_err(|_| DispatchError::Closed),
            Queue::Bounded {
                sender,
                policy: QueuePolicy::Block,
            } => sender.send(task).map_err(|_| DispatchError::Closed),
            Queue::Bounded {
                sender,
                policy: QueuePolicy::Reject,
            } => sender.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => DispatchError::QueueFull,
                TrySendError::Disconnected(_) => DispatchError::Closed,
            }),
        };
        if result.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn in_flight(&self) -> usize {
        self.active.get()
    }

    fn queued(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl<C: Connection> Drop for WorkerPool<C> {
    fn drop(&mut self) {
        // Closing the queue lets workers drain it and exit.
        drop(self.queue.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = worker.id, "Worker thread panicked");
                }
            }
        }
        debug!("Worker pool stopped");
    }
}

fn worker_loop<C: Connection>(
    id: usize,
    receiver: Arc<Mutex<Receiver<Task<C>>>>,
    handler: ConnectionHandler,
    active: ActiveCount,
    pending: Arc<AtomicUsize>,
) {
    debug!(worker = id, "Worker started");

    loop {
        // The lock is held only while waiting for the next task.
        let next = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(poisoned) => poisoned.into_inner().recv(),
        };
        let Ok(task) = next else {
            break;
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        let _active = active.enter();
        if panic::catch_unwind(AssertUnwindSafe(|| task.run(&handler))).is_err() {
            error!(worker = id, "Task panicked, worker continuing");
        }
    }

    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{wait_until, written, MockConnection, Probe};
    use std::time::{Duration, Instant};

    fn pool(
        size: usize,
        queue_capacity: Option<usize>,
        policy: QueuePolicy,
    ) -> WorkerPool<MockConnection> {
        WorkerPool::new(PoolOptions {
            size,
            queue_capacity,
            queue_policy: policy,
            stack_size: None,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::<MockConnection>::new(PoolOptions {
            size: 0,
            queue_capacity: None,
            queue_policy: QueuePolicy::Block,
            stack_size: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrency_bounded_by_pool_size() {
        const P: usize = 3;
        const K: usize = 12;
        let probe = Probe::new();
        let pool = pool(P, None, QueuePolicy::Block);
        assert_eq!(pool.size(), P);

        let start = Instant::now();
        for _ in 0..K {
            pool.submit(MockConnection::new(&probe, "x\n").with_delay(Duration::from_millis(50)))
                .unwrap();
        }
        // Unbounded queue: submission never waits on the workers.
        assert!(start.elapsed() < Duration::from_millis(50));

        assert!(wait_until(Duration::from_secs(5), || probe.closed() == K));
        assert_eq!(probe.handled(), K);
        assert!(probe.peak() <= P);
        assert!(probe.peak() > 1);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_worker_survives_failures() {
        let probe = Probe::new();
        let pool = pool(1, None, QueuePolicy::Block);

        pool.submit(MockConnection::failing(&probe)).unwrap();
        pool.submit(MockConnection::panicking(&probe)).unwrap();
        let conn = MockConnection::new(&probe, "still here\n");
        let output = conn.output();
        pool.submit(conn).unwrap();

        assert!(wait_until(Duration::from_secs(5), || probe.closed() == 3));
        let text = written(&output);
        assert!(text.contains("Task execution server thread [worker-0]"));
        assert!(text.contains("still here"));
    }

    #[test]
    fn test_queued_count() {
        let probe = Probe::new();
        let pool = pool(1, None, QueuePolicy::Block);

        pool.submit(MockConnection::new(&probe, "a\n").with_delay(Duration::from_millis(200)))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || probe.active() == 1));
        pool.submit(MockConnection::new(&probe, "b\n")).unwrap();
        pool.submit(MockConnection::new(&probe, "c\n")).unwrap();

        assert_eq!(pool.queued(), 2);
        assert_eq!(pool.in_flight(), 1);
        assert!(wait_until(Duration::from_secs(5), || probe.closed() == 3));
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_bounded_reject_closes_connection() {
        let probe = Probe::new();
        let pool = pool(1, Some(1), QueuePolicy::Reject);

        pool.submit(MockConnection::new(&probe, "busy\n").with_delay(Duration::from_millis(200)))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || probe.active() == 1));
        pool.submit(MockConnection::new(&probe, "queued\n")).unwrap();

        let result = pool.submit(MockConnection::new(&probe, "rejected\n"));
        assert!(matches!(result, Err(DispatchError::QueueFull)));
        assert_eq!(probe.closed(), 1);

        assert!(wait_until(Duration::from_secs(5), || probe.closed() == 3));
        assert_eq!(probe.handled(), 2);
        assert_eq!(probe.leaked(), 0);
    }

    #[test]
    fn test_bounded_block_waits_for_space() {
        let probe = Probe::new();
        let pool = pool(1, Some(1), QueuePolicy::Block);

        pool.submit(MockConnection::new(&probe, "busy\n").with_delay(Duration::from_millis(300)))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || probe.active() == 1));
        pool.submit(MockConnection::new(&probe, "queued\n")).unwrap();

        let start = Instant::now();
        pool.submit(MockConnection::new(&probe, "waits\n")).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert!(wait_until(Duration::from_secs(5), || probe.closed() == 3));
    }

    #[test]
    fn test_drop_drains_queue() {
        let probe = Probe::new();
        let pool = pool(2, None, QueuePolicy::Block);

        for _ in 0..10 {
            pool.submit(MockConnection::new(&probe, "x\n").with_delay(Duration::from_millis(10)))
                .unwrap();
        }
        drop(pool);

        assert_eq!(probe.handled(), 10);
        assert_eq!(probe.closed(), 10);
        assert_eq!(probe.leaked(), 0);
    }
}
