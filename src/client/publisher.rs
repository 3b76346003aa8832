use crate::{
    client::shared::{
        client_runtime, connect_retrying, write_task, ActiveConn, ConnState, SEND_QUEUE_DEPTH,
    },
    codec::{CodecRegistry, Message},
    error::Error,
    tasks::TaskSet,
    wire::{ClientFlag, ClientRole, RequestFrame, SerializeMode, CONNECT_TIMEOUT_MS},
};
use bytes::Bytes;
use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, runtime::Runtime, sync::mpsc};
use tracing::debug;

/// The publisher client.
///
/// Publishes are fire-and-forget PUBLISHER-role frames: they carry no
/// call-id and get no response. The broker fans each one out to the
/// subscribers of `(topic, mode)` at that moment.
///
/// ```no_run
/// use murmur::PubClient;
///
/// let mut client = PubClient::new().connect("127.0.0.1:50051".parse().unwrap());
/// client.run().unwrap();
/// client.publish_raw("prices", &b"42.5"[..]).unwrap();
/// ```
pub struct PubClient {
    addr: Option<SocketAddr>,
    connect_timeout: Duration,
    codecs: Arc<CodecRegistry>,
    rt: Option<Runtime>,
    inner: Option<Arc<PubInner>>,
}

impl fmt::Debug for PubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubClient")
            .field("addr", &self.addr)
            .field("running", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

struct PubInner {
    addr: SocketAddr,
    connect_timeout: Duration,
    state: Mutex<ConnState>,
    connect_guard: tokio::sync::Mutex<()>,
    tasks: TaskSet,
}

impl Default for PubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PubClient {
    /// Create an unconnected publisher.
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

    /// The codec registry for structured payloads.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Start the client reactor and connect eagerly.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.inner.is_some() {
            return Ok(());
        }
        let addr = self.addr.ok_or(Error::NotRunning)?;

        let rt = client_runtime("murmur-publisher")?;
        let inner = Arc::new(PubInner {
            addr,
            connect_timeout: self.connect_timeout,
            state: Mutex::new(ConnState::default()),
            connect_guard: tokio::sync::Mutex::new(()),
            tasks: TaskSet::with_handle(rt.handle().clone()),
        });

        rt.block_on(PubInner::ensure_connected(&inner)).map(|_| ())?;

        self.rt = Some(rt);
        self.inner = Some(inner);
        Ok(())
    }

    /// Stop the client. Idempotent.
    pub fn stop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.tasks.cancel();
            ConnState::clear(&inner.state);
        }
        if let Some(rt) = self.rt.take() {
            rt.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Publish a structured message to a topic.
    pub fn publish(&self, topic: impl Into<String>, message: Message) -> Result<(), Error> {
        let body = self.codecs.encode(&message.name, &message.value)?;
        self.publish_inner(
            topic.into(),
            message.name,
            body.into(),
            SerializeMode::Structured,
        )
    }

    /// Publish opaque bytes to a topic.
    pub fn publish_raw(&self, topic: impl Into<String>, body: impl Into<Bytes>) -> Result<(), Error> {
        self.publish_inner(topic.into(), String::new(), body.into(), SerializeMode::Raw)
    }

    fn publish_inner(
        &self,
        topic: String,
        message_name: String,
        body: Bytes,
        mode: SerializeMode,
    ) -> Result<(), Error> {
        let (rt, inner) = match (&self.rt, &self.inner) {
            (Some(rt), Some(inner)) => (rt, inner),
            _ => return Err(Error::NotRunning),
        };
        let frame = RequestFrame {
            call_id: 0,
            flag: ClientFlag::new(mode, ClientRole::Publisher),
            protocol: topic,
            message_name,
            body,
        };
        let wire = frame.encode()?;
        rt.block_on(async {
            let active = PubInner::ensure_connected(inner).await?;
            active.enqueue(wire).await
        })
    }
}

impl Drop for PubClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PubInner {
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

        let active = ConnState::install(&this.state, tx);
        let watcher = this.clone();
        let generation = active.generation;
        let tasks_for_watcher = conn_tasks.clone();
        conn_tasks.spawn_cancellable(watcher.watch_peer(read_half, generation, tasks_for_watcher));

        debug!(addr = %this.addr, "publisher connected");
        Ok(active)
    }

    /// The server never pushes to publishers; the read half only reports
    /// closure. Seeing EOF (or anything else) tears the connection down so
    /// the next publish reconnects.
    async fn watch_peer(self: Arc<Self>, mut read_half: OwnedReadHalf, generation: u64, tasks: TaskSet) {
        let mut sink = [0u8; 64];
        loop {
            match read_half.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        debug!("publisher connection closed by peer");
        tasks.cancel();
        ConnState::clear_if_current(&self.state, generation);
    }
}
