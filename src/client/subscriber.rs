use crate::{
    client::shared::{
        client_runtime, connect_retrying, write_task, ActiveConn, ConnState, SEND_QUEUE_DEPTH,
    },
    codec::{CodecRegistry, Message},
    error::Error,
    tasks::TaskSet,
    wire::{
        ClientFlag, ClientRole, PushFrame, RequestFrame, SerializeMode, CANCEL_SUBSCRIBE_FLAG,
        CONNECT_TIMEOUT_MS, HEARTBEAT_FLAG, HEARTBEAT_PERIOD_MS, SUBSCRIBE_FLAG,
    },
    workers::WorkerPool,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{net::tcp::OwnedReadHalf, runtime::Runtime, sync::mpsc};
use tracing::{debug, trace, warn};

type StructuredCallback = Arc<dyn Fn(Message) + Send + Sync>;
type RawCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

enum SubCallback {
    Structured(StructuredCallback),
    Raw(RawCallback),
}

#[derive(Default)]
struct Topics {
    structured: HashMap<String, StructuredCallback>,
    raw: HashMap<String, RawCallback>,
}

/// The subscriber client.
///
/// Keeps a local registry of topic → callback, sends SUBSCRIBER-role
/// control frames to the broker, and dispatches incoming push frames to the
/// matching callback on a single worker thread — which is what preserves
/// per-topic ordering. A heartbeat timer keeps otherwise-silent
/// subscription connections alive, and every reconnect replays the whole
/// registry before anything else goes out on the new connection.
///
/// ```no_run
/// use murmur::SubClient;
///
/// let mut client = SubClient::new().connect("127.0.0.1:50051".parse().unwrap());
/// client.run().unwrap();
/// client.subscribe_raw("prices", |body| {
///     println!("tick: {body:?}");
/// }).unwrap();
/// ```
pub struct SubClient {
    addr: Option<SocketAddr>,
    connect_timeout: Duration,
    codecs: Arc<CodecRegistry>,
    rt: Option<Runtime>,
    inner: Option<Arc<SubInner>>,
}

impl fmt::Debug for SubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubClient")
            .field("addr", &self.addr)
            .field("running", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

struct SubInner {
    addr: SocketAddr,
    connect_timeout: Duration,
    codecs: Arc<CodecRegistry>,
    workers: Arc<WorkerPool>,
    state: Mutex<ConnState>,
    connect_guard: tokio::sync::Mutex<()>,
    topics: Mutex<Topics>,
    last_inbound: Mutex<Instant>,
    tasks: TaskSet,
}

impl Default for SubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SubClient {
    /// Create an unconnected subscriber.
    pub fn new() -> Self {
        Self {
            addr: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            codecs: Arc::new(CodecRegistry::new()),
            rt: None,
            inner: None,
        }
    }

    /// Set the server endpoint.
    pub fn connect(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// The codec registry for structured push payloads.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Start the client reactor, dispatch worker, and heartbeat timer, and
    /// connect eagerly.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.inner.is_some() {
            return Ok(());
        }
        let addr = self.addr.ok_or(Error::NotRunning)?;

        let rt = client_runtime("murmur-subscriber")?;
        let inner = Arc::new(SubInner {
            addr,
            connect_timeout: self.connect_timeout,
            codecs: self.codecs.clone(),
            // One dispatch worker preserves per-topic callback order.
            workers: Arc::new(WorkerPool::new(1)),
            state: Mutex::new(ConnState::default()),
            connect_guard: tokio::sync::Mutex::new(()),
            topics: Mutex::new(Topics::default()),
            last_inbound: Mutex::new(Instant::now()),
            tasks: TaskSet::with_handle(rt.handle().clone()),
        });

        rt.block_on(SubInner::ensure_connected(&inner)).map(|_| ())?;
        inner.tasks.spawn_cancellable(inner.clone().heartbeat_loop());

        self.rt = Some(rt);
        self.inner = Some(inner);
        Ok(())
    }

    /// Stop the client. Idempotent.
    pub fn stop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.tasks.cancel();
            ConnState::clear(&inner.state);
            inner.workers.stop();
        }
        if let Some(rt) = self.rt.take() {
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Subscribe to a structured topic. The callback runs on the dispatch
    /// worker with each decoded message, in publish order.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        callback: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.control(
            topic.into(),
            Some(SubCallback::Structured(Arc::new(callback))),
            SerializeMode::Structured,
            SUBSCRIBE_FLAG,
        )
    }

    /// Subscribe to a raw topic. The callback runs on the dispatch worker
    /// with each body, in publish order.
    pub fn subscribe_raw(
        &self,
        topic: impl Into<String>,
        callback: impl Fn(Bytes) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        self.control(
            topic.into(),
            Some(SubCallback::Raw(Arc::new(callback))),
            SerializeMode::Raw,
            SUBSCRIBE_FLAG,
        )
    }

    /// Cancel a structured subscription.
    pub fn cancel_subscribe(&self, topic: impl Into<String>) -> Result<(), Error> {
        self.control(
            topic.into(),
            None,
            SerializeMode::Structured,
            CANCEL_SUBSCRIBE_FLAG,
        )
    }

    /// Cancel a raw subscription.
    pub fn cancel_subscribe_raw(&self, topic: impl Into<String>) -> Result<(), Error> {
        self.control(topic.into(), None, SerializeMode::Raw, CANCEL_SUBSCRIBE_FLAG)
    }

    /// Whether a structured subscription is registered locally.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.as_ref().is_some_and(|inner| {
            inner
                .topics
                .lock()
                .expect("topics lock poisoned")
                .structured
                .contains_key(topic)
        })
    }

    /// Whether a raw subscription is registered locally.
    pub fn is_subscribed_raw(&self, topic: &str) -> bool {
        self.inner.as_ref().is_some_and(|inner| {
            inner
                .topics
                .lock()
                .expect("topics lock poisoned")
                .raw
                .contains_key(topic)
        })
    }

    fn control(
        &self,
        topic: String,
        callback: Option<SubCallback>,
        mode: SerializeMode,
        flag: &'static str,
    ) -> Result<(), Error> {
        let (rt, inner) = match (&self.rt, &self.inner) {
            (Some(rt), Some(inner)) => (rt, inner),
            _ => return Err(Error::NotRunning),
        };
        rt.block_on(SubInner::control(inner, topic, callback, mode, flag))
    }
}

impl Drop for SubClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SubInner {
    /// Register or remove the local callback, then send the control frame.
    /// Connecting first means a reconnect replay never includes the topic
    /// this very call is about to announce.
    async fn control(
        this: &Arc<Self>,
        topic: String,
        callback: Option<SubCallback>,
        mode: SerializeMode,
        flag: &'static str,
    ) -> Result<(), Error> {
        let active = Self::ensure_connected(this).await?;

        {
            let mut topics = this.topics.lock().expect("topics lock poisoned");
            match (&callback, mode) {
                (Some(SubCallback::Structured(cb)), _) => {
                    topics.structured.insert(topic.clone(), cb.clone());
                }
                (Some(SubCallback::Raw(cb)), _) => {
                    topics.raw.insert(topic.clone(), cb.clone());
                }
                (None, SerializeMode::Structured) => {
                    topics.structured.remove(&topic);
                }
                (None, SerializeMode::Raw) => {
                    topics.raw.remove(&topic);
                }
            }
        }

        let frame = control_frame(&topic, mode, flag);
        active.enqueue(frame.encode()?).await
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

        let conn_tasks = this.tasks.child();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        conn_tasks.spawn_cancellable(write_task(write_half, rx, conn_tasks.clone()));

        // Replay every known topic before the new connection carries
        // anything else.
        let replay: Vec<(String, SerializeMode)> = {
            let topics = this.topics.lock().expect("topics lock poisoned");
            topics
                .structured
                .keys()
                .map(|t| (t.clone(), SerializeMode::Structured))
                .chain(topics.raw.keys().map(|t| (t.clone(), SerializeMode::Raw)))
                .collect()
        };
        for (topic, mode) in replay {
            trace!(%topic, "replaying subscription");
            let frame = control_frame(&topic, mode, SUBSCRIBE_FLAG);
            if tx.send(frame.encode()?).await.is_err() {
                return Err(Error::Closed);
            }
        }

        *this.last_inbound.lock().expect("inbound lock poisoned") = Instant::now();

        let active = ConnState::install(&this.state, tx);
        let reader = this.clone();
        let generation = active.generation;
        let tasks_for_reader = conn_tasks.clone();
        conn_tasks.spawn_cancellable(reader.read_loop(read_half, generation, tasks_for_reader));

        debug!(addr = %this.addr, "subscriber connected");
        Ok(active)
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, generation: u64, tasks: TaskSet) {
        loop {
            match PushFrame::read(&mut read_half).await {
                Ok(push) => {
                    *self.last_inbound.lock().expect("inbound lock poisoned") = Instant::now();
                    self.dispatch(push);
                }
                Err(err) => {
                    debug!(%err, "push stream closed");
                    break;
                }
            }
        }
        tasks.cancel();
        ConnState::clear_if_current(&self.state, generation);
    }

    /// Hand a push frame to its topic callback via the dispatch worker.
    fn dispatch(&self, push: PushFrame) {
        let callback = {
            let topics = self.topics.lock().expect("topics lock poisoned");
            match push.mode {
                SerializeMode::Structured => topics
                    .structured
                    .get(&push.protocol)
                    .cloned()
                    .map(SubCallback::Structured),
                SerializeMode::Raw => topics.raw.get(&push.protocol).cloned().map(SubCallback::Raw),
            }
        };
        let Some(callback) = callback else {
            debug!(topic = %push.protocol, "push for unknown topic");
            return;
        };

        let codecs = self.codecs.clone();
        let job = move || match callback {
            SubCallback::Structured(cb) => {
                match codecs.decode(&push.message_name, &push.body) {
                    Ok(value) => cb(Message::new(push.message_name, value)),
                    Err(err) => warn!(%err, topic = %push.protocol, "failed to decode push"),
                }
            }
            SubCallback::Raw(cb) => cb(push.body),
        };

        if self.workers.submit(job).is_err() {
            debug!("dispatch worker stopped; dropping push");
        }
    }

    /// Send a heartbeat whenever the connection has been silent for a full
    /// period. Reconnects (and thereby replays subscriptions) if the
    /// connection died since the last tick.
    async fn heartbeat_loop(self: Arc<Self>) {
        let period = Duration::from_millis(HEARTBEAT_PERIOD_MS);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let idle = self
                .last_inbound
                .lock()
                .expect("inbound lock poisoned")
                .elapsed();
            if idle <= period {
                continue;
            }

            match Self::ensure_connected(&self).await {
                Ok(active) => {
                    let frame = RequestFrame {
                        call_id: 0,
                        flag: ClientFlag::new(SerializeMode::Structured, ClientRole::Subscriber),
                        protocol: HEARTBEAT_FLAG.to_owned(),
                        message_name: String::new(),
                        body: Bytes::from_static(HEARTBEAT_FLAG.as_bytes()),
                    };
                    match frame.encode() {
                        Ok(wire) => {
                            if active.enqueue(wire).await.is_err() {
                                debug!("heartbeat enqueue failed");
                            }
                        }
                        Err(err) => warn!(%err, "failed to encode heartbeat"),
                    }
                }
                Err(err) => warn!(%err, "heartbeat reconnect failed"),
            }
        }
    }
}

fn control_frame(topic: &str, mode: SerializeMode, flag: &'static str) -> RequestFrame {
    RequestFrame {
        call_id: 0,
        flag: ClientFlag::new(mode, ClientRole::Subscriber),
        protocol: topic.to_owned(),
        message_name: String::new(),
        body: Bytes::from_static(flag.as_bytes()),
    }
}
