//! Fixed-size worker pool for handler and completion code.
//!
//! Handler code never runs on a reactor thread — it would head-of-line
//! block every connection attached to that loop. The router and the
//! clients submit nullary jobs here instead.

use crossbeam_channel::{bounded, Sender};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Mutex,
    thread,
};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Depth of the job FIFO. Senders block when it is full; the bound only
/// guards against unbounded pile-up, the per-connection send queue is the
/// primary back-pressure mechanism.
const WORK_QUEUE_DEPTH: usize = 1024;

/// Submitting to a stopped pool.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("worker pool is stopped")]
pub struct PoolStopped;

/// A fixed set of threads draining a bounded FIFO of jobs.
///
/// `stop` is idempotent: it rejects new work, drains jobs already queued,
/// and joins the workers. Dropping the pool stops it.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stopped", &self.tx.lock().expect("pool lock poisoned").is_none())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<Job>(WORK_QUEUE_DEPTH);

        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("murmur-worker-{i}"))
                    .spawn(move || {
                        // recv fails once every sender is gone and the
                        // queue is drained; that is the stop signal.
                        while let Ok(job) = rx.recv() {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("worker job panicked");
                            }
                        }
                        trace!("worker exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. Blocks while the FIFO is full.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolStopped>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = {
            let guard = self.tx.lock().expect("pool lock poisoned");
            guard.clone().ok_or(PoolStopped)?
        };
        tx.send(Box::new(job)).map_err(|_| PoolStopped)
    }

    /// Stop the pool: reject new work, drain the queue, join the workers.
    pub fn stop(&self) {
        drop(self.tx.lock().expect("pool lock poisoned").take());
        let workers = std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn stop_is_idempotent_and_submission_after_stop_errors() {
        let pool = WorkerPool::new(1);
        pool.stop();
        pool.stop();
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn drains_queued_jobs_on_stop() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn survives_panicking_jobs() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom")).unwrap();
        let c = counter.clone();
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
