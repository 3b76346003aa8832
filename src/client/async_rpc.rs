use crate::{
    client::shared::{
        client_runtime, connect_retrying, write_task, ActiveConn, ConnState, SEND_QUEUE_DEPTH,
    },
    codec::{CodecRegistry, Message},
    error::Error,
    tasks::TaskSet,
    wire::{ClientFlag, ClientRole, RequestFrame, ResponseFrame, SerializeMode, CONNECT_TIMEOUT_MS},
    workers::WorkerPool,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{net::tcp::OwnedReadHalf, runtime::Runtime, sync::mpsc};
use tracing::{debug, warn};

/// Hook fired after every successful (re)connect, e.g. to re-issue
/// registrations the server forgot with the old connection.
pub type ConnectNotify = Arc<dyn Fn() + Send + Sync>;

enum Completion {
    Structured(Box<dyn FnOnce(Result<Message, Error>) + Send>),
    Raw(Box<dyn FnOnce(Result<Bytes, Error>) + Send>),
}

/// The asynchronous RPC caller.
///
/// Many calls may be outstanding; responses are correlated back to their
/// completion callbacks by call-id. Completions run on the client's worker
/// pool, never on its reactor. If the connection drops, pending completions
/// are discarded without being invoked — the documented at-most-once
/// policy — and callers see the failure on their next call attempt.
///
/// ```no_run
/// use murmur::{AsyncRpcClient, Message};
/// use serde_json::json;
///
/// let mut client = AsyncRpcClient::new().connect("127.0.0.1:50051".parse().unwrap());
/// client.codecs().register_json("person_info_req");
/// client.codecs().register_json("person_info_rsp");
/// client.run().unwrap();
///
/// let req = Message::new("person_info_req", json!({"name": "Jack", "age": 20}));
/// client.async_call("request_person_info", req).result(|reply| {
///     println!("{reply:?}");
/// }).unwrap();
/// ```
pub struct AsyncRpcClient {
    addr: Option<SocketAddr>,
    connect_timeout: Duration,
    codecs: Arc<CodecRegistry>,
    connect_notify: Mutex<Option<ConnectNotify>>,
    rt: Option<Runtime>,
    inner: Option<Arc<AsyncInner>>,
}

impl fmt::Debug for AsyncRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRpcClient")
            .field("addr", &self.addr)
            .field("running", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

struct AsyncInner {
    addr: SocketAddr,
    connect_timeout: Duration,
    codecs: Arc<CodecRegistry>,
    workers: Arc<WorkerPool>,
    state: Mutex<ConnState>,
    connect_guard: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<u32, Completion>>,
    next_call_id: AtomicU32,
    connect_notify: Mutex<Option<ConnectNotify>>,
    tasks: TaskSet,
}

impl Default for AsyncRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRpcClient {
    /// Create an unconnected caller.
    pub fn new() -> Self {
        Self {
            addr: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            codecs: Arc::new(CodecRegistry::new()),
            connect_notify: Mutex::new(None),
            rt: None,
            inner: None,
        }
    }

    /// Set the server endpoint.
    pub fn connect(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// The codec registry for structured payloads.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Register the reconnect hook. Fires after every successful
    /// (re)connect, including the initial one made by [`Self::run`].
    pub fn set_connect_success_notify(&self, notify: impl Fn() + Send + Sync + 'static) {
        let notify: ConnectNotify = Arc::new(notify);
        *self
            .connect_notify
            .lock()
            .expect("notify lock poisoned") = Some(notify.clone());
        if let Some(inner) = &self.inner {
            *inner.connect_notify.lock().expect("notify lock poisoned") = Some(notify);
        }
    }

    /// Start the client reactor and worker, and connect eagerly.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.inner.is_some() {
            return Ok(());
        }
        let addr = self.addr.ok_or(Error::NotRunning)?;

        let rt = client_runtime("murmur-async-rpc")?;
        let inner = Arc::new(AsyncInner {
            addr,
            connect_timeout: self.connect_timeout,
            codecs: self.codecs.clone(),
            workers: Arc::new(WorkerPool::new(1)),
            state: Mutex::new(ConnState::default()),
            connect_guard: tokio::sync::Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(1),
            connect_notify: Mutex::new(
                self.connect_notify
                    .lock()
                    .expect("notify lock poisoned")
                    .clone(),
            ),
            tasks: TaskSet::with_handle(rt.handle().clone()),
        });

        rt.block_on(AsyncInner::ensure_connected(&inner)).map(|_| ())?;

        self.rt = Some(rt);
        self.inner = Some(inner);
        Ok(())
    }

    /// Stop the client: drop the connection and pending completions, stop
    /// the worker, join the reactor. Idempotent.
    pub fn stop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.tasks.cancel();
            ConnState::clear(&inner.state);
            inner.pending.lock().expect("pending lock poisoned").clear();
            inner.workers.stop();
        }
        if let Some(rt) = self.rt.take() {
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Begin a structured call. Nothing is sent until
    /// [`CallBuilder::result`] supplies the completion.
    pub fn async_call(&self, protocol: impl Into<String>, message: Message) -> CallBuilder<'_> {
        CallBuilder {
            client: self,
            protocol: protocol.into(),
            message,
        }
    }

    /// Begin a raw call. Nothing is sent until [`RawCallBuilder::result`]
    /// supplies the completion.
    pub fn async_call_raw(
        &self,
        protocol: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> RawCallBuilder<'_> {
        RawCallBuilder {
            client: self,
            protocol: protocol.into(),
            body: body.into(),
        }
    }

    fn running(&self) -> Result<(&Runtime, &Arc<AsyncInner>), Error> {
        match (&self.rt, &self.inner) {
            (Some(rt), Some(inner)) => Ok((rt, inner)),
            _ => Err(Error::NotRunning),
        }
    }
}

impl Drop for AsyncRpcClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A structured call waiting for its completion callback.
#[must_use = "the call is not sent until `result` is invoked"]
pub struct CallBuilder<'a> {
    client: &'a AsyncRpcClient,
    protocol: String,
    message: Message,
}

impl fmt::Debug for CallBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBuilder")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl CallBuilder<'_> {
    /// Send the call; `callback` fires exactly once with the decoded reply
    /// or the error.
    pub fn result(
        self,
        callback: impl FnOnce(Result<Message, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        let (rt, inner) = self.client.running()?;
        let body = inner.codecs.encode(&self.message.name, &self.message.value)?;
        rt.block_on(AsyncInner::dispatch(
            inner,
            self.protocol,
            self.message.name,
            body.into(),
            SerializeMode::Structured,
            Completion::Structured(Box::new(callback)),
        ))
    }
}

/// A raw call waiting for its completion callback.
#[must_use = "the call is not sent until `result` is invoked"]
pub struct RawCallBuilder<'a> {
    client: &'a AsyncRpcClient,
    protocol: String,
    body: Bytes,
}

impl fmt::Debug for RawCallBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCallBuilder")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl RawCallBuilder<'_> {
    /// Send the call; `callback` fires exactly once with the reply bytes or
    /// the error.
    pub fn result(
        self,
        callback: impl FnOnce(Result<Bytes, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        let (rt, inner) = self.client.running()?;
        rt.block_on(AsyncInner::dispatch(
            inner,
            self.protocol,
            String::new(),
            self.body,
            SerializeMode::Raw,
            Completion::Raw(Box::new(callback)),
        ))
    }
}

impl AsyncInner {
    fn next_call_id(&self) -> u32 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            // 0 is reserved for uncorrelated frames; skip it on wrap.
            if id != 0 {
                return id;
            }
        }
    }

    async fn dispatch(
        this: &Arc<Self>,
        protocol: String,
        message_name: String,
        body: Bytes,
        mode: SerializeMode,
        completion: Completion,
    ) -> Result<(), Error> {
        let active = Self::ensure_connected(this).await?;
        let call_id = this.next_call_id();
        let frame = RequestFrame {
            call_id,
            flag: ClientFlag::new(mode, ClientRole::AsyncRpc),
            protocol,
            message_name,
            body,
        };
        let wire = frame.encode()?;

        this.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(call_id, completion);

        if let Err(err) = active.enqueue(wire).await {
            this.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&call_id);
            return Err(err);
        }
        Ok(())
    }

    async fn ensure_connected(this: &Arc<Self>) -> Result<ActiveConn, Error> {
        if let Some(active) = ConnState::current(&this.state) {
            return Ok(active);
        }

        let _guard = this.connect_guard.lock().await;
        if let Some(active) = ConnState::current(&this.state) {
            return Ok(active);
        }

        let stream = connect_retrying(this.addr, this.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        // A fresh state machine: whatever was pending belongs to the old
        // connection and is dropped, not completed.
        this.pending.lock().expect("pending lock poisoned").clear();

        let conn_tasks = this.tasks.child();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        conn_tasks.spawn_cancellable(write_task(write_half, rx, conn_tasks.clone()));

        let active = ConnState::install(&this.state, tx);
        let reader = this.clone();
        let generation = active.generation;
        let tasks_for_reader = conn_tasks.clone();
        conn_tasks.spawn_cancellable(reader.read_loop(read_half, generation, tasks_for_reader));

        debug!(addr = %this.addr, "async rpc client connected");
        let notify = this
            .connect_notify
            .lock()
            .expect("notify lock poisoned")
            .clone();
        if let Some(notify) = notify {
            notify();
        }
        Ok(active)
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, generation: u64, tasks: TaskSet) {
        loop {
            match ResponseFrame::read(&mut read_half).await {
                Ok(response) => self.complete(response),
                Err(err) => {
                    debug!(%err, "response stream closed");
                    break;
                }
            }
        }
        tasks.cancel();
        if ConnState::clear_if_current(&self.state, generation) {
            // At-most-once: pending completions are dropped, not invoked.
            self.pending.lock().expect("pending lock poisoned").clear();
        }
    }

    /// Correlate a response to its completion and run it on the worker
    /// pool. Responses with no pending entry are logged and dropped.
    fn complete(&self, response: ResponseFrame) {
        let completion = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&response.call_id);
        let Some(completion) = completion else {
            debug!(call_id = response.call_id, "response with no pending call");
            return;
        };

        let codecs = self.codecs.clone();
        let job = move || match completion {
            Completion::Structured(callback) => {
                let result = if response.error_code.is_ok() {
                    codecs
                        .decode_message(&response.message_name, &response.body)
                        .map_err(Error::from)
                } else {
                    Err(Error::Rpc(response.error_code))
                };
                callback(result);
            }
            Completion::Raw(callback) => {
                let result = if response.error_code.is_ok() {
                    Ok(response.body)
                } else {
                    Err(Error::Rpc(response.error_code))
                };
                callback(result);
            }
        };

        if self.workers.submit(job).is_err() {
            warn!("worker pool stopped; dropping completion");
        }
    }
}
