use std::cell::Cell;
use std::sync::mpsc::{self, Receiver};

use anyhow::{anyhow, Context, Result};
use log::error;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// A job handed to the pool whose result has not been gathered yet.
pub struct Pending<T> {
    label: String,
    rx: Receiver<Result<T>>,
}

/// Fixed-size worker pool. Jobs start as soon as they are submitted; the
/// coordinating thread only blocks in [`WorkerPool::gather`].
pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
    outstanding: Cell<usize>,
    peak: Cell<usize>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("generate-worker-{}", i))
            .panic_handler(|_| error!("worker task panicked"))
            .build()
            .context("building worker pool")?;
        Ok(WorkerPool {
            pool,
            workers,
            outstanding: Cell::new(0),
            peak: Cell::new(0),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn submit<T, F>(&self, label: impl Into<String>, job: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            // The receiver only disappears if the coordinator already gave up.
            let _ = tx.send(job());
        });
        let outstanding = self.outstanding.get() + 1;
        self.outstanding.set(outstanding);
        self.peak.set(self.peak.get().max(outstanding));
        Pending {
            label: label.into(),
            rx,
        }
    }

    /// Blocks until every job has finished, in submission order. The first
    /// failure is returned as an error and the remaining jobs are abandoned.
    pub fn gather<T>(&self, pending: Vec<Pending<T>>) -> Result<Vec<T>> {
        let total = pending.len();
        let mut out = Vec::with_capacity(total);
        for (i, job) in pending.into_iter().enumerate() {
            let received = job.rx.recv();
            self.release(1);
            let outcome = received
                .map_err(|_| anyhow!("worker task {} terminated without a result", job.label))
                .and_then(|r| r.with_context(|| format!("worker task {} failed", job.label)));
            match outcome {
                Ok(value) => out.push(value),
                Err(e) => {
                    self.release(total - i - 1);
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    fn release(&self, n: usize) {
        self.outstanding.set(self.outstanding.get().saturating_sub(n));
    }

    /// Largest number of submitted but not yet gathered jobs seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.get()
    }
}
