//! The reactor pool: N event loops, one thread each.
//!
//! The accept loop runs on the first reactor; every accepted connection is
//! pinned to a reactor chosen round-robin, so all reads and queued writes
//! for one connection originate from a single thread.

use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::runtime::{Builder, Handle, Runtime};

/// A cloneable round-robin dispenser of reactor handles.
#[derive(Debug, Clone)]
pub(crate) struct IoHandles {
    handles: Arc<[Handle]>,
    next: Arc<AtomicUsize>,
}

impl IoHandles {
    /// The reactor the acceptor runs on.
    pub(crate) fn primary(&self) -> &Handle {
        &self.handles[0]
    }

    /// The reactor the next connection is pinned to.
    pub(crate) fn next(&self) -> Handle {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles[i % self.handles.len()].clone()
    }
}

/// A pool of single-worker tokio runtimes.
#[derive(Debug)]
pub(crate) struct IoPool {
    runtimes: Vec<Runtime>,
    handles: IoHandles,
}

impl IoPool {
    pub(crate) fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtimes = (0..threads)
            .map(|i| {
                Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(format!("murmur-io-{i}"))
                    .enable_all()
                    .build()
            })
            .collect::<io::Result<Vec<_>>>()?;

        let handles: Arc<[Handle]> = runtimes.iter().map(Runtime::handle).cloned().collect();
        Ok(Self {
            runtimes,
            handles: IoHandles {
                handles,
                next: Arc::new(AtomicUsize::new(0)),
            },
        })
    }

    pub(crate) fn handles(&self) -> IoHandles {
        self.handles.clone()
    }

    /// Block on a future on the primary reactor. Used for listener setup
    /// from the synchronous server lifecycle.
    pub(crate) fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtimes[0].block_on(fut)
    }

    /// Tear the reactors down, giving in-flight tasks a grace period to
    /// run their teardown paths.
    pub(crate) fn shutdown(self, grace: Duration) {
        for rt in self.runtimes {
            rt.shutdown_timeout(grace);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Each reactor has exactly one worker thread, so the thread a task
    /// lands on identifies its reactor.
    fn worker_thread(handle: &Handle) -> std::thread::ThreadId {
        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            let _ = tx.send(std::thread::current().id());
        });
        rx.recv().expect("reactor task ran")
    }

    #[test]
    fn round_robin_cycles_all_reactors() {
        let pool = IoPool::new(3).unwrap();
        let handles = pool.handles();

        let threads: Vec<_> = (0..6).map(|_| worker_thread(&handles.next())).collect();
        assert_eq!(threads[0], threads[3]);
        assert_eq!(threads[1], threads[4]);
        assert_eq!(threads[2], threads[5]);
        assert_ne!(threads[0], threads[1]);

        pool.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn zero_threads_still_builds_one_reactor() {
        let pool = IoPool::new(0).unwrap();
        let handles = pool.handles();
        assert_eq!(
            worker_thread(handles.primary()),
            worker_thread(&handles.next())
        );
        pool.shutdown(Duration::from_millis(100));
    }
}
