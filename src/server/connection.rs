use crate::{
    server::ServerState,
    tasks::TaskSet,
    wire::{RequestFrame, CHECK_REQUEST_TIMEOUT_MS, CONNECT_TIMEOUT_MS},
};
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    pin,
    runtime::Handle,
    select,
    sync::mpsc,
};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, trace};
use uuid::Uuid;

/// Depth of the per-connection send queue. A full queue back-pressures
/// whoever is enqueueing (broker fan-out, handler replies) until the peer
/// drains the wire.
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 64;

/// The send side of a connection went away mid-enqueue.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("connection closed")]
pub(crate) struct ConnectionClosed;

/// A cloneable reference to a live server connection: its session id, its
/// send queue, and the token that tears it down.
///
/// The broker and the router hold these; the connection's own tasks are the
/// only code touching the socket.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    session_id: Arc<str>,
    outbound: mpsc::Sender<Bytes>,
    tasks: TaskSet,
}

impl ConnectionHandle {
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append a pre-serialised frame to the send queue. Reactor context.
    pub(crate) async fn enqueue(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
        self.outbound.send(frame).await.map_err(|_| ConnectionClosed)
    }

    /// Append a pre-serialised frame to the send queue, blocking while the
    /// queue is full. Worker-thread context only.
    pub(crate) fn enqueue_blocking(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
        self.outbound
            .blocking_send(frame)
            .map_err(|_| ConnectionClosed)
    }

    /// Idempotent teardown. Further enqueues fail; queued frames are
    /// discarded with the writer.
    pub(crate) fn disconnect(&self) {
        self.tasks.cancel();
    }
}

/// Attach an accepted socket to its reactor: assign a session id, fire the
/// connect notification, and spawn the read task, writer task, and liveness
/// sweep.
pub(crate) fn spawn(
    state: Arc<ServerState>,
    stream: TcpStream,
    server_tasks: &TaskSet,
    reactor: Handle,
) {
    let session_id: Arc<str> = Uuid::new_v4().to_string().into();
    let tasks = server_tasks.child_on(reactor);
    let (outbound, send_queue) = mpsc::channel(DEFAULT_SEND_QUEUE_DEPTH);

    let conn = ConnectionHandle {
        session_id: session_id.clone(),
        outbound,
        tasks: tasks.clone(),
    };
    let last_inbound = Arc::new(Mutex::new(Instant::now()));

    debug!(session_id = %session_id, "client connected");
    if let Some(notify) = &state.connect_notify {
        notify(&session_id);
    }

    let (read_half, write_half) = stream.into_split();

    tasks.spawn_cancellable(write_task(write_half, send_queue, tasks.clone()));
    tasks.spawn_cancellable(liveness_sweep(last_inbound.clone(), tasks.clone()));
    tasks.spawn_graceful(move |cancel| read_task(state, read_half, conn, last_inbound, cancel));
}

/// Read loop: alternate header and payload reads, hand each frame to the
/// router. Any frame error ends the connection. Teardown runs here and only
/// here: subscriptions leave the broker first, then the disconnect
/// notification fires, exactly once.
async fn read_task(
    state: Arc<ServerState>,
    mut read_half: OwnedReadHalf,
    conn: ConnectionHandle,
    last_inbound: Arc<Mutex<Instant>>,
    cancel: WaitForCancellationFutureOwned,
) {
    pin!(cancel);

    loop {
        select! {
            biased;
            _ = &mut cancel => {
                trace!(session_id = %conn.session_id(), "read task cancelled");
                break;
            }
            frame = RequestFrame::read(&mut read_half) => {
                match frame {
                    Ok(request) => {
                        *last_inbound.lock().expect("liveness lock poisoned") = Instant::now();
                        if !state.router.route(&state, request, &conn).await {
                            trace!(session_id = %conn.session_id(), "request not routed");
                        }
                    }
                    Err(err) => {
                        debug!(%err, session_id = %conn.session_id(), "connection read failed");
                        break;
                    }
                }
            }
        }
    }

    state.broker.remove_all(conn.session_id());
    debug!(session_id = %conn.session_id(), "client disconnected");
    if let Some(notify) = &state.disconnect_notify {
        notify(conn.session_id());
    }
    conn.disconnect();
}

/// Writer task: drain the send queue in FIFO order. A write error discards
/// the rest of the queue and closes the connection.
async fn write_task(mut write_half: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>, tasks: TaskSet) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            debug!(%err, "connection write failed");
            break;
        }
    }
    queue.close();
    tasks.cancel();
}

/// Disconnect connections that stay silent past the liveness limit. The
/// subscriber heartbeat exists to keep long-lived subscriptions under it.
async fn liveness_sweep(last_inbound: Arc<Mutex<Instant>>, tasks: TaskSet) {
    let limit = Duration::from_millis(CONNECT_TIMEOUT_MS);
    let mut ticker = tokio::time::interval(Duration::from_millis(CHECK_REQUEST_TIMEOUT_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let idle = last_inbound.lock().expect("liveness lock poisoned").elapsed();
        if idle > limit {
            debug!(?idle, "connection exceeded liveness limit");
            tasks.cancel();
            break;
        }
    }
}

#[cfg(test)]
pub(crate) fn test_handle(session_id: &str) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
    let (outbound, rx) = mpsc::channel(DEFAULT_SEND_QUEUE_DEPTH);
    (
        ConnectionHandle {
            session_id: session_id.into(),
            outbound,
            tasks: TaskSet::default(),
        },
        rx,
    )
}
