use crate::{
    client::shared::CONNECT_RETRY_MS,
    codec::{CodecRegistry, Message},
    error::Error,
    wire::{
        ClientFlag, ClientRole, FrameError, RequestFrame, ResponseFrame, SerializeMode,
        CONNECT_TIMEOUT_MS,
    },
};
use bytes::Bytes;
use std::{
    io::Write,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::debug;

/// The synchronous RPC caller.
///
/// One connection, one in-flight call: an internal mutex serialises
/// [`call`] so request/response pairs strictly alternate on the wire. The
/// connection is made lazily and re-made after any failure; a call timeout
/// closes the connection to abort the outstanding read.
///
/// ```no_run
/// use murmur::RpcClient;
///
/// let client = RpcClient::new()
///     .connect("127.0.0.1:50051".parse().unwrap())
///     .timeout(3000);
/// let reply = client.call_raw("echo", &b"hello"[..]).unwrap();
/// ```
///
/// [`call`]: Self::call
#[derive(Debug)]
pub struct RpcClient {
    codecs: Arc<CodecRegistry>,
    addr: Option<SocketAddr>,
    timeout: Option<Duration>,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    /// Create an unconnected caller.
    pub fn new() -> Self {
        Self {
            codecs: Arc::new(CodecRegistry::new()),
            addr: None,
            timeout: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            stream: Mutex::new(None),
        }
    }

    /// Set the server endpoint.
    pub fn connect(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Per-call timeout in milliseconds; 0 disables it. Expiry closes the
    /// connection and the call fails with [`Error::Timeout`].
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        self
    }

    /// The codec registry for structured payloads.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Connect eagerly. Calls connect lazily anyway; this only surfaces
    /// configuration and reachability problems early.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut guard = self.lock_stream();
        self.ensure_connected(&mut guard).map(|_| ())
    }

    /// Close the connection. The next call reconnects.
    pub fn stop(&mut self) {
        Self::drop_stream(&mut self.lock_stream());
    }

    /// Call a structured method and wait for its reply.
    pub fn call(&self, protocol: impl Into<String>, message: Message) -> Result<Message, Error> {
        let body = self.codecs.encode(&message.name, &message.value)?;
        let request = self.request(
            protocol.into(),
            message.name,
            body.into(),
            SerializeMode::Structured,
        );
        let response = self.write_and_read(&request)?;
        if !response.error_code.is_ok() {
            return Err(Error::Rpc(response.error_code));
        }
        self.codecs
            .decode_message(&response.message_name, &response.body)
            .map_err(Into::into)
    }

    /// Call a raw method and wait for its reply bytes.
    pub fn call_raw(&self, protocol: impl Into<String>, body: impl Into<Bytes>) -> Result<Bytes, Error> {
        let request = self.request(protocol.into(), String::new(), body.into(), SerializeMode::Raw);
        let response = self.write_and_read(&request)?;
        if !response.error_code.is_ok() {
            return Err(Error::Rpc(response.error_code));
        }
        Ok(response.body)
    }

    /// Send a structured request without waiting for a reply.
    pub fn call_one_way(&self, protocol: impl Into<String>, message: Message) -> Result<(), Error> {
        let body = self.codecs.encode(&message.name, &message.value)?;
        let request = self.request(
            protocol.into(),
            message.name,
            body.into(),
            SerializeMode::Structured,
        );
        self.write_only(&request)
    }

    /// Send a raw request without waiting for a reply.
    pub fn call_one_way_raw(
        &self,
        protocol: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let request = self.request(protocol.into(), String::new(), body.into(), SerializeMode::Raw);
        self.write_only(&request)
    }

    fn request(
        &self,
        protocol: String,
        message_name: String,
        body: Bytes,
        mode: SerializeMode,
    ) -> RequestFrame {
        RequestFrame {
            call_id: 0,
            flag: ClientFlag::new(mode, ClientRole::Rpc),
            protocol,
            message_name,
            body,
        }
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().expect("rpc client lock poisoned")
    }

    fn drop_stream(guard: &mut Option<TcpStream>) {
        if let Some(stream) = guard.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Lazily (re)connect, retrying every 20 ms until the connect deadline.
    fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<TcpStream>,
    ) -> Result<&'a mut TcpStream, Error> {
        match guard {
            Some(stream) => Ok(stream),
            slot @ None => {
                let addr = self.addr.ok_or(Error::NotRunning)?;
                Ok(slot.insert(Self::connect_retrying(addr, self.connect_timeout)?))
            }
        }
    }

    fn connect_retrying(addr: SocketAddr, deadline: Duration) -> Result<TcpStream, Error> {
        let started = Instant::now();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(Error::ConnectTimeout(deadline));
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(%err, %addr, "connect attempt failed");
                    std::thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
                }
            }
        }
    }

    fn write_only(&self, request: &RequestFrame) -> Result<(), Error> {
        let wire = request.encode()?;
        let mut guard = self.lock_stream();
        let stream = self.ensure_connected(&mut guard)?;
        if let Err(err) = stream.write_all(&wire) {
            Self::drop_stream(&mut guard);
            return Err(err.into());
        }
        Ok(())
    }

    /// The in-flight-one invariant lives here: the lock is held across the
    /// write and the matching read, so the next frame on the wire is always
    /// this call's response.
    fn write_and_read(&self, request: &RequestFrame) -> Result<ResponseFrame, Error> {
        let wire = request.encode()?;
        let mut guard = self.lock_stream();
        let stream = self.ensure_connected(&mut guard)?;

        if let Err(err) = stream.write_all(&wire) {
            Self::drop_stream(&mut guard);
            return Err(err.into());
        }
        if let Err(err) = stream.set_read_timeout(self.timeout) {
            Self::drop_stream(&mut guard);
            return Err(err.into());
        }

        match ResponseFrame::read_blocking(stream) {
            Ok(response) => Ok(response),
            Err(FrameError::Io(err)) if is_timeout(&err) => {
                debug!("call timed out; disconnecting");
                Self::drop_stream(&mut guard);
                Err(Error::Timeout)
            }
            Err(err) => {
                Self::drop_stream(&mut guard);
                Err(err.into())
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
