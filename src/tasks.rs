use std::future::Future;

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFutureOwned},
    task::TaskTracker,
};

/// A wrapper around a [`TaskTracker`] and a [`CancellationToken`], used to
/// manage a set of tasks and signal them to shut down together.
///
/// When a [`Handle`] is provided, tasks are spawned on that handle.
/// Otherwise they are spawned on the current runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSet {
    tasks: TaskTracker,
    token: CancellationToken,
    handle: Option<Handle>,
}

impl From<Handle> for TaskSet {
    fn from(handle: Handle) -> Self {
        Self::with_handle(handle)
    }
}

impl TaskSet {
    /// Create a new [`TaskSet`] pinned to a runtime handle.
    pub(crate) fn with_handle(handle: Handle) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
            handle: Some(handle),
        }
    }

    /// Get a handle to the runtime that the task set is running on.
    ///
    /// ## Panics
    ///
    /// This will panic if called outside the context of a Tokio runtime
    /// when no handle was provided.
    fn handle(&self) -> Handle {
        self.handle.clone().unwrap_or_else(Handle::current)
    }

    /// Cancel the token, causing all tasks to be cancelled.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Get a child [`TaskSet`], pinned to a specific handle. The child is
    /// cancelled when the parent is, or may be cancelled independently.
    pub(crate) fn child_on(&self, handle: Handle) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: self.token.child_token(),
            handle: Some(handle),
        }
    }

    /// Get a child [`TaskSet`] on the same handle as the parent.
    pub(crate) fn child(&self) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: self.token.child_token(),
            handle: self.handle.clone(),
        }
    }

    /// Spawn a future that is dropped outright when the set is cancelled.
    pub(crate) fn spawn_cancellable<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        let fut = async move {
            tokio::select! {
                _ = token.cancelled() => None,
                result = task => Some(result),
            }
        };
        self.tasks.spawn_on(fut, &self.handle())
    }

    /// Spawn a future that receives the cancellation future and is
    /// responsible for observing it, so it can run teardown code after the
    /// signal instead of being dropped mid-await.
    pub(crate) fn spawn_graceful<F, Fut>(&self, task: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(WaitForCancellationFutureOwned) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let fut = task(self.token.clone().cancelled_owned());
        self.tasks.spawn_on(fut, &self.handle())
    }
}
