//! The server: listeners, pools, router, and broker under one lifecycle.
//!
//! Handlers are registered first, endpoints and thread counts configured
//! next, then [`Server::run`] starts the reactor pool, the worker pool, and
//! the accept loops. [`Server::stop`] tears everything down in order: stop
//! accepting, disconnect live connections (which flushes their broker
//! registrations), drain the workers, join the reactors.

mod broker;
pub(crate) use broker::Broker;

pub(crate) mod connection;
pub use connection::DEFAULT_SEND_QUEUE_DEPTH;

mod router;
pub(crate) use router::Router;
pub use router::{
    IntoRawHandler, IntoStructuredHandler, OneWay, RawHandler, StructuredHandler, WithReply,
};

use crate::{
    codec::CodecRegistry,
    error::Error,
    io_pool::{IoHandles, IoPool},
    tasks::TaskSet,
    workers::WorkerPool,
};
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, error, trace};

/// Callback invoked with a session id on client connect or disconnect.
pub type SessionNotify = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything a connection needs to route and answer requests. Shared
/// between the accept loop, every connection task, and every worker job.
pub(crate) struct ServerState {
    pub(crate) router: Arc<Router>,
    pub(crate) broker: Arc<Broker>,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) workers: Arc<WorkerPool>,
    pub(crate) connect_notify: Option<SessionNotify>,
    pub(crate) disconnect_notify: Option<SessionNotify>,
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("router", &self.router)
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

struct Running {
    io_pool: IoPool,
    workers: Arc<WorkerPool>,
    root_tasks: TaskSet,
    bound: Vec<SocketAddr>,
}

/// The RPC / pub-sub server.
///
/// ```no_run
/// use murmur::{Server, HandlerError};
/// use bytes::Bytes;
///
/// let mut server = Server::new()
///     .bind_raw("echo", |body: Bytes, _session: &str| {
///         Ok::<_, HandlerError>(body)
///     })
///     .listen(["127.0.0.1:50051".parse().unwrap()])
///     .ios_threads(2)
///     .work_threads(4);
/// server.run().unwrap();
/// ```
pub struct Server {
    router: Arc<Router>,
    broker: Arc<Broker>,
    codecs: Arc<CodecRegistry>,
    endpoints: Vec<SocketAddr>,
    ios_threads: usize,
    work_threads: usize,
    connect_notify: Option<SessionNotify>,
    disconnect_notify: Option<SessionNotify>,
    running: Option<Running>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoints", &self.endpoints)
            .field("ios_threads", &self.ios_threads)
            .field("work_threads", &self.work_threads)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a server with no bindings, no endpoints, and one thread per
    /// pool.
    pub fn new() -> Self {
        Self {
            router: Arc::new(Router::default()),
            broker: Arc::new(Broker::default()),
            codecs: Arc::new(CodecRegistry::new()),
            endpoints: Vec::new(),
            ios_threads: 1,
            work_threads: 1,
            connect_notify: None,
            disconnect_notify: None,
            running: None,
        }
    }

    /// Register a structured handler. Rebinding a name replaces its handler.
    pub fn bind<M>(
        self,
        protocol: impl Into<String>,
        handler: impl IntoStructuredHandler<M>,
    ) -> Self {
        self.router.bind(protocol, handler);
        self
    }

    /// Register a raw handler. Lives in a map disjoint from [`Self::bind`],
    /// so the same name may carry both a structured and a raw handler.
    pub fn bind_raw<M>(self, protocol: impl Into<String>, handler: impl IntoRawHandler<M>) -> Self {
        self.router.bind_raw(protocol, handler);
        self
    }

    /// Remove a structured binding. Unknown names are a no-op.
    pub fn unbind(&self, protocol: &str) {
        self.router.unbind(protocol);
    }

    /// Remove a raw binding. Unknown names are a no-op.
    pub fn unbind_raw(&self, protocol: &str) {
        self.router.unbind_raw(protocol);
    }

    /// Set the endpoints to listen on.
    pub fn listen(mut self, endpoints: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.endpoints = endpoints.into_iter().collect();
        self
    }

    /// Number of reactor threads (default 1).
    pub fn ios_threads(mut self, n: usize) -> Self {
        self.ios_threads = n;
        self
    }

    /// Number of worker threads running handler code (default 1).
    pub fn work_threads(mut self, n: usize) -> Self {
        self.work_threads = n;
        self
    }

    /// Notification fired with the session id of every accepted connection.
    pub fn set_client_connect_notify(mut self, notify: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.connect_notify = Some(Arc::new(notify));
        self
    }

    /// Notification fired exactly once per connection on close, after its
    /// subscriptions have left the broker.
    pub fn set_client_disconnect_notify(
        mut self,
        notify: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.disconnect_notify = Some(Arc::new(notify));
        self
    }

    /// The codec registry consulted for structured payloads. Register
    /// message codecs here before serving structured calls.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// The addresses actually bound. Useful when listening on port 0.
    /// Empty while the server is not running.
    pub fn bound_addrs(&self) -> &[SocketAddr] {
        self.running.as_ref().map(|r| r.bound.as_slice()).unwrap_or(&[])
    }

    /// Start pools, open every listener, begin accepting. Idempotent while
    /// running.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.running.is_some() {
            return Ok(());
        }

        let io_pool = IoPool::new(self.ios_threads)?;
        let workers = Arc::new(WorkerPool::new(self.work_threads));
        let state = Arc::new(ServerState {
            router: self.router.clone(),
            broker: self.broker.clone(),
            codecs: self.codecs.clone(),
            workers: workers.clone(),
            connect_notify: self.connect_notify.clone(),
            disconnect_notify: self.disconnect_notify.clone(),
        });

        let root_tasks = TaskSet::with_handle(io_pool.handles().primary().clone());
        let reactors = io_pool.handles();

        let mut bound = Vec::with_capacity(self.endpoints.len());
        for addr in &self.endpoints {
            let listener = io_pool.block_on(TcpListener::bind(*addr))?;
            bound.push(listener.local_addr()?);
            root_tasks.spawn_cancellable(accept_loop(
                listener,
                state.clone(),
                root_tasks.clone(),
                reactors.clone(),
            ));
        }
        debug!(?bound, "server listening");

        self.running = Some(Running {
            io_pool,
            workers,
            root_tasks,
            bound,
        });
        Ok(())
    }

    /// Stop accepting, disconnect every live connection, drain the worker
    /// queue, and join the reactor threads. Idempotent.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        debug!("server stopping");

        // Cancelling the root set stops the accept loops and fires every
        // connection's teardown (broker flush + disconnect notification),
        // which runs on the still-live reactors.
        running.root_tasks.cancel();
        running.workers.stop();
        running.io_pool.shutdown(Duration::from_secs(1));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept connections forever, pinning each to the next reactor.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    tasks: TaskSet,
    reactors: IoHandles,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(%peer, "accepted connection");
                connection::spawn(state.clone(), stream, &tasks, reactors.next());
            }
            Err(err) => {
                error!(%err, "failed to accept connection");
                continue;
            }
        }
    }
}
