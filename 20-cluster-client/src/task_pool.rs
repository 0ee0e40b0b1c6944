//! Fixed set of named worker threads for fan-out work.
//!
//! Scans, batch reads and queries all need the same thing: run one closure
//! per item (usually per node) on a bounded number of threads and collect
//! the results. [`TaskPool::run`] does that and hands results back in the
//! order the items were given.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Starts `threads` workers; zero means one per available CPU.
    pub fn new(threads: usize, name_prefix: &str) -> Result<Self> {
        let threads = if threads == 0 {
            thread::available_parallelism().map_or(4, |n| n.get())
        } else {
            threads
        };
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-{id}"))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .map_err(|err| Error::from_io(err, "spawn pool worker"))?;
            workers.push(handle);
        }
        debug!(threads, name_prefix, "task pool started");
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Runs `f` once per item and returns the results in input order.
    ///
    /// Blocks until every item has finished. A panic inside `f` is carried
    /// back to the caller once the other items are done; the worker that
    /// ran it keeps serving.
    pub fn run<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let Some(jobs) = &self.jobs else {
            return Vec::new();
        };
        let count = items.len();
        let f = Arc::new(f);
        let (done_tx, done_rx) = unbounded();
        for (index, item) in items.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let done_tx = done_tx.clone();
            let job: Job = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(item)));
                let _ = done_tx.send((index, outcome));
            });
            if jobs.send(job).is_err() {
                warn!("task pool workers are gone");
                break;
            }
        }
        drop(done_tx);

        let mut slots: Vec<Option<thread::Result<R>>> = (0..count).map(|_| None).collect();
        for (index, outcome) in done_rx.iter() {
            slots[index] = Some(outcome);
        }
        slots
            .into_iter()
            .flatten()
            .map(|outcome| outcome.unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("task pool worker panicked");
            }
        }
    }
}
