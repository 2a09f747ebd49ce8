//! Worker pool for CPU-bound prime computation.
//!
//! A fixed set of OS threads pulls jobs from one shared queue, so any number
//! of sessions can submit concurrently without external locking. When every
//! worker is busy, submissions wait in the queue.
//!
//! Threads are spawned lazily on the first submission and live for the rest
//! of the process. There is no cancellation: a submitted job always runs to
//! completion.

use crate::compute::{nth_prime, ComputeError};
use std::num::NonZeroU64;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of compute workers.
pub struct WorkerPool {
    size: usize,
    queue: OnceLock<mpsc::Sender<Job>>,
}

/// Pending result of a [`WorkerPool::submit`] call.
pub struct Ticket {
    rx: oneshot::Receiver<u64>,
}

impl Ticket {
    /// Block the calling thread until the worker finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn result(self) -> Result<u64, ComputeError> {
        self.rx.blocking_recv().map_err(|_| ComputeError::WorkerLost)
    }
}

impl WorkerPool {
    /// Create a pool of `size` workers. No threads are started yet.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            queue: OnceLock::new(),
        }
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a computation and return a ticket for its result.
    pub fn submit(&self, n: NonZeroU64) -> Result<Ticket, ComputeError> {
        let (tx, rx) = oneshot::channel();
        self.submit_with(n, move |prime| {
            // Receiver gone means the session went away; nothing to do.
            let _ = tx.send(prime);
        })?;
        Ok(Ticket { rx })
    }

    /// Queue a computation and run `on_done` with the result on the worker
    /// thread.
    pub fn submit_with<F>(&self, n: NonZeroU64, on_done: F) -> Result<(), ComputeError>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let job: Job = Box::new(move || on_done(nth_prime(n)));
        self.queue()
            .send(job)
            .map_err(|_| ComputeError::PoolUnavailable)
    }

    fn queue(&self) -> &mpsc::Sender<Job> {
        self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::channel::<Job>();
            let rx = Arc::new(Mutex::new(rx));

            let mut started = 0;
            for worker_id in 0..self.size {
                let rx = Arc::clone(&rx);
                let spawned = thread::Builder::new()
                    .name(format!("prime-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, rx));

                match spawned {
                    Ok(_) => started += 1,
                    Err(e) => error!(worker = worker_id, error = %e, "Failed to spawn pool worker"),
                }
            }

            // With no workers the receiver is dropped here and every send fails.
            debug!(workers = started, "Worker pool started");
            tx
        })
    }
}

fn worker_loop(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    trace!(worker = worker_id, "Pool worker started");

    loop {
        // Hold the lock only while waiting, never while running a job.
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };

        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }

    trace!(worker = worker_id, "Pool worker stopped");
}
