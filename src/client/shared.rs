use crate::{error::Error, tasks::TaskSet};
use bytes::Bytes;
use std::{
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
};
use tracing::debug;

/// Sleep between connect attempts while the deadline has not passed.
pub(crate) const CONNECT_RETRY_MS: u64 = 20;

/// Depth of a caller-side send queue.
pub(crate) const SEND_QUEUE_DEPTH: usize = 64;

/// Dial until it sticks or the deadline runs out.
pub(crate) async fn connect_retrying(addr: SocketAddr, deadline: Duration) -> Result<TcpStream, Error> {
    let started = Instant::now();
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if started.elapsed() >= deadline {
                    debug!(%err, %addr, "connect deadline exhausted");
                    return Err(Error::ConnectTimeout(deadline));
                }
                tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_MS)).await;
            }
        }
    }
}

/// One live caller-side connection. Cloned out of [`ConnState`] by whoever
/// needs to enqueue; the generation ties it to the state slot it came from.
#[derive(Debug, Clone)]
pub(crate) struct ActiveConn {
    pub(crate) outbound: mpsc::Sender<Bytes>,
    pub(crate) generation: u64,
}

impl ActiveConn {
    pub(crate) async fn enqueue(&self, frame: Bytes) -> Result<(), Error> {
        self.outbound.send(frame).await.map_err(|_| Error::Closed)
    }
}

/// Caller-side connection slot. Reconnecting bumps the generation so a
/// stale read loop cannot clear the slot out from under its successor.
#[derive(Debug, Default)]
pub(crate) struct ConnState {
    active: Option<ActiveConn>,
    generation: u64,
}

impl ConnState {
    pub(crate) fn current(state: &Mutex<Self>) -> Option<ActiveConn> {
        state.lock().expect("conn state lock poisoned").active.clone()
    }

    /// Install a fresh connection and return its generation.
    pub(crate) fn install(state: &Mutex<Self>, outbound: mpsc::Sender<Bytes>) -> ActiveConn {
        let mut s = state.lock().expect("conn state lock poisoned");
        s.generation += 1;
        let active = ActiveConn {
            outbound,
            generation: s.generation,
        };
        s.active = Some(active.clone());
        active
    }

    /// Clear the slot, but only if it still holds `generation`. Returns
    /// whether this call did the clearing.
    pub(crate) fn clear_if_current(state: &Mutex<Self>, generation: u64) -> bool {
        let mut s = state.lock().expect("conn state lock poisoned");
        if s.active.as_ref().is_some_and(|a| a.generation == generation) {
            s.active = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(state: &Mutex<Self>) {
        state.lock().expect("conn state lock poisoned").active = None;
    }
}

/// Writer task: drain the send queue in FIFO order; a write error discards
/// the queue and cancels the connection's tasks.
pub(crate) async fn write_task(
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    tasks: TaskSet,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            debug!(%err, "client write failed");
            break;
        }
    }
    queue.close();
    tasks.cancel();
}

/// The single-worker reactor every client runs its I/O on.
pub(crate) fn client_runtime(name: &str) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(name)
        .enable_all()
        .build()
}
