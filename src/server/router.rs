use crate::{
    codec::{CodecRegistry, Message},
    error::HandlerError,
    server::{connection::ConnectionHandle, ServerState},
    wire::{
        ClientRole, ErrorCode, RequestFrame, ResponseFrame, SerializeMode, CANCEL_SUBSCRIBE_FLAG,
        HEARTBEAT_FLAG, SUBSCRIBE_FLAG,
    },
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};
use tracing::{debug, error, trace, warn};

/// A structured method handler. Runs on a worker thread with the decoded
/// request and the caller's session id; returning `None` suppresses the
/// response (one-way call).
pub trait StructuredHandler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, request: Message, session_id: &str) -> Result<Option<Message>, HandlerError>;
}

/// A raw method handler. Runs on a worker thread with the opaque body and
/// the caller's session id; returning empty bytes suppresses the response.
pub trait RawHandler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, body: Bytes, session_id: &str) -> Result<Bytes, HandlerError>;
}

/// Marker for reply-producing handler closures.
///
/// This type should never be constructed, and importing it is almost
/// certainly a mistake.
#[derive(Debug, Clone, Copy)]
pub struct WithReply {
    _sealed: (),
}

/// Marker for one-way handler closures.
#[derive(Debug, Clone, Copy)]
pub struct OneWay {
    _sealed: (),
}

/// Conversion of user callables into [`StructuredHandler`]s.
///
/// Blanket-implemented for closures of either arm:
/// - `Fn(Message, &str) -> Result<Message, HandlerError>` (reply-producing)
/// - `Fn(Message, &str) -> Result<(), HandlerError>` (one-way)
///
/// The `M` marker parameter only disambiguates the two blanket impls and is
/// never constructed.
pub trait IntoStructuredHandler<M> {
    /// Erase the callable into a shared handler.
    fn into_structured_handler(self) -> Arc<dyn StructuredHandler>;
}

/// Conversion of user callables into [`RawHandler`]s; arms as for
/// [`IntoStructuredHandler`], over `Bytes` in and out.
pub trait IntoRawHandler<M> {
    /// Erase the callable into a shared handler.
    fn into_raw_handler(self) -> Arc<dyn RawHandler>;
}

struct ReplyFn<F>(F);

impl<F> StructuredHandler for ReplyFn<F>
where
    F: Fn(Message, &str) -> Result<Message, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, request: Message, session_id: &str) -> Result<Option<Message>, HandlerError> {
        (self.0)(request, session_id).map(Some)
    }
}

struct OneWayFn<F>(F);

impl<F> StructuredHandler for OneWayFn<F>
where
    F: Fn(Message, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn call(&self, request: Message, session_id: &str) -> Result<Option<Message>, HandlerError> {
        (self.0)(request, session_id).map(|()| None)
    }
}

impl<F> IntoStructuredHandler<WithReply> for F
where
    F: Fn(Message, &str) -> Result<Message, HandlerError> + Send + Sync + 'static,
{
    fn into_structured_handler(self) -> Arc<dyn StructuredHandler> {
        Arc::new(ReplyFn(self))
    }
}

impl<F> IntoStructuredHandler<OneWay> for F
where
    F: Fn(Message, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn into_structured_handler(self) -> Arc<dyn StructuredHandler> {
        Arc::new(OneWayFn(self))
    }
}

struct RawReplyFn<F>(F);

impl<F> RawHandler for RawReplyFn<F>
where
    F: Fn(Bytes, &str) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, body: Bytes, session_id: &str) -> Result<Bytes, HandlerError> {
        (self.0)(body, session_id)
    }
}

struct RawOneWayFn<F>(F);

impl<F> RawHandler for RawOneWayFn<F>
where
    F: Fn(Bytes, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn call(&self, body: Bytes, session_id: &str) -> Result<Bytes, HandlerError> {
        (self.0)(body, session_id).map(|()| Bytes::new())
    }
}

impl<F> IntoRawHandler<WithReply> for F
where
    F: Fn(Bytes, &str) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
{
    fn into_raw_handler(self) -> Arc<dyn RawHandler> {
        Arc::new(RawReplyFn(self))
    }
}

impl<F> IntoRawHandler<OneWay> for F
where
    F: Fn(Bytes, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn into_raw_handler(self) -> Arc<dyn RawHandler> {
        Arc::new(RawOneWayFn(self))
    }
}

/// The name → handler map, in two disjoint modes. The same name may be
/// bound in both independently; rebinding a name replaces its handler.
#[derive(Default)]
pub(crate) struct Router {
    structured: RwLock<HashMap<String, Arc<dyn StructuredHandler>>>,
    raw: RwLock<HashMap<String, Arc<dyn RawHandler>>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field(
                "structured",
                &self.structured.read().expect("router lock poisoned").len(),
            )
            .field("raw", &self.raw.read().expect("router lock poisoned").len())
            .finish()
    }
}

impl Router {
    pub(crate) fn bind<M>(&self, protocol: impl Into<String>, handler: impl IntoStructuredHandler<M>) {
        self.structured
            .write()
            .expect("router lock poisoned")
            .insert(protocol.into(), handler.into_structured_handler());
    }

    pub(crate) fn bind_raw<M>(&self, protocol: impl Into<String>, handler: impl IntoRawHandler<M>) {
        self.raw
            .write()
            .expect("router lock poisoned")
            .insert(protocol.into(), handler.into_raw_handler());
    }

    pub(crate) fn unbind(&self, protocol: &str) {
        self.structured
            .write()
            .expect("router lock poisoned")
            .remove(protocol);
    }

    pub(crate) fn unbind_raw(&self, protocol: &str) {
        self.raw.write().expect("router lock poisoned").remove(protocol);
    }

    pub(crate) fn is_bound(&self, protocol: &str) -> bool {
        self.structured
            .read()
            .expect("router lock poisoned")
            .contains_key(protocol)
    }

    pub(crate) fn is_bound_raw(&self, protocol: &str) -> bool {
        self.raw
            .read()
            .expect("router lock poisoned")
            .contains_key(protocol)
    }

    /// Route one inbound request by its client role. Returns whether the
    /// frame found a consumer. Reactor context: everything that can block
    /// is pushed onto the worker pool.
    pub(crate) async fn route(
        &self,
        state: &Arc<ServerState>,
        request: RequestFrame,
        conn: &ConnectionHandle,
    ) -> bool {
        match request.flag.role {
            ClientRole::Rpc | ClientRole::AsyncRpc => self.route_rpc(state, request, conn).await,
            ClientRole::Publisher => {
                let workers = state.workers.clone();
                let state = state.clone();
                workers
                    .submit(move || {
                        state.broker.publish(
                            &request.protocol,
                            &request.message_name,
                            request.body,
                            request.flag.mode,
                        );
                    })
                    .is_ok()
            }
            ClientRole::Subscriber => self.route_control(state, request, conn),
        }
    }

    async fn route_rpc(
        &self,
        state: &Arc<ServerState>,
        request: RequestFrame,
        conn: &ConnectionHandle,
    ) -> bool {
        let call_id = request.call_id;
        let job: Option<Box<dyn FnOnce() + Send>> = match request.flag.mode {
            SerializeMode::Structured => self
                .structured
                .read()
                .expect("router lock poisoned")
                .get(&request.protocol)
                .cloned()
                .map(|handler| {
                    let codecs = state.codecs.clone();
                    let conn = conn.clone();
                    Box::new(move || invoke_structured(&*handler, &codecs, request, &conn)) as _
                }),
            SerializeMode::Raw => self
                .raw
                .read()
                .expect("router lock poisoned")
                .get(&request.protocol)
                .cloned()
                .map(|handler| {
                    let conn = conn.clone();
                    Box::new(move || invoke_raw(&*handler, request, &conn)) as _
                }),
        };

        let Some(job) = job else {
            // Route miss: answer directly from the reactor, no worker trip.
            return self.reply_route_failed(call_id, conn).await;
        };

        if state.workers.submit(job).is_err() {
            debug!("worker pool stopped; dropping request");
            return false;
        }
        true
    }

    async fn reply_route_failed(&self, call_id: u32, conn: &ConnectionHandle) -> bool {
        let frame = ResponseFrame::error(call_id, ErrorCode::RouteFailed);
        match frame.encode() {
            Ok(wire) => {
                if conn.enqueue(wire).await.is_err() {
                    trace!("connection closed before route-failed reply");
                }
            }
            Err(err) => error!(%err, "failed to encode route-failed reply"),
        }
        false
    }

    /// SUBSCRIBER-role frames: heartbeats are recognised and dropped; the
    /// body's flag byte selects subscribe or cancel.
    fn route_control(
        &self,
        state: &Arc<ServerState>,
        request: RequestFrame,
        conn: &ConnectionHandle,
    ) -> bool {
        if request.protocol == HEARTBEAT_FLAG {
            trace!(session_id = %conn.session_id(), "heartbeat");
            return true;
        }

        let conn = conn.clone();
        let state_for_job = state.clone();
        let submitted = state.workers.submit(move || {
            let RequestFrame {
                protocol: topic,
                body,
                flag,
                ..
            } = request;
            if body.as_ref() == SUBSCRIBE_FLAG.as_bytes() {
                trace!(session_id = %conn.session_id(), %topic, "subscribe");
                state_for_job.broker.subscribe(conn, topic, flag.mode);
            } else if body.as_ref() == CANCEL_SUBSCRIBE_FLAG.as_bytes() {
                trace!(session_id = %conn.session_id(), %topic, "cancel subscribe");
                state_for_job.broker.cancel(conn.session_id(), &topic, flag.mode);
            } else {
                warn!(%topic, "subscriber control frame with unknown flag byte");
            }
        });
        submitted.is_ok()
    }
}

/// Run a structured handler on the worker pool: decode, call, re-encode.
/// Handler and codec failures become a handler-failed response; panics are
/// caught and treated the same. Worker-thread context.
fn invoke_structured(
    handler: &dyn StructuredHandler,
    codecs: &CodecRegistry,
    request: RequestFrame,
    conn: &ConnectionHandle,
) {
    let call_id = request.call_id;
    let session_id = conn.session_id().to_owned();

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Option<Message>, HandlerError> {
        let value = codecs.decode(&request.message_name, &request.body)?;
        handler.call(Message::new(request.message_name.clone(), value), &session_id)
    }));

    let frame = match outcome {
        Ok(Ok(Some(reply))) => match codecs.encode(&reply.name, &reply.value) {
            Ok(body) => ResponseFrame {
                call_id,
                error_code: ErrorCode::Ok,
                message_name: reply.name,
                body: body.into(),
            },
            Err(err) => {
                warn!(%err, "failed to encode handler reply");
                ResponseFrame::error(call_id, ErrorCode::HandlerFailed)
            }
        },
        Ok(Ok(None)) => return,
        Ok(Err(err)) => {
            warn!(%err, protocol = %request.protocol, "handler failed");
            ResponseFrame::error(call_id, ErrorCode::HandlerFailed)
        }
        Err(_) => {
            error!(protocol = %request.protocol, "handler panicked");
            ResponseFrame::error(call_id, ErrorCode::HandlerFailed)
        }
    };

    send_reply(frame, conn);
}

/// Run a raw handler on the worker pool. An empty reply body suppresses the
/// response. Worker-thread context.
fn invoke_raw(handler: &dyn RawHandler, request: RequestFrame, conn: &ConnectionHandle) {
    let call_id = request.call_id;
    let session_id = conn.session_id().to_owned();

    let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(request.body, &session_id)));

    let frame = match outcome {
        Ok(Ok(reply)) if reply.is_empty() => return,
        Ok(Ok(reply)) => ResponseFrame {
            call_id,
            error_code: ErrorCode::Ok,
            message_name: String::new(),
            body: reply,
        },
        Ok(Err(err)) => {
            warn!(%err, protocol = %request.protocol, "handler failed");
            ResponseFrame::error(call_id, ErrorCode::HandlerFailed)
        }
        Err(_) => {
            error!(protocol = %request.protocol, "handler panicked");
            ResponseFrame::error(call_id, ErrorCode::HandlerFailed)
        }
    };

    send_reply(frame, conn);
}

fn send_reply(frame: ResponseFrame, conn: &ConnectionHandle) {
    match frame.encode() {
        Ok(wire) => {
            if conn.enqueue_blocking(wire).is_err() {
                trace!(session_id = %conn.session_id(), "connection closed before reply");
            }
        }
        Err(err) => error!(%err, "failed to encode reply"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn echo_structured(request: Message, _session: &str) -> Result<Message, HandlerError> {
        Ok(request)
    }

    #[test]
    fn rebinding_replaces() {
        let router = Router::default();
        router.bind("m", |_: Message, _: &str| {
            Ok::<_, HandlerError>(Message::new("first", json!(1)))
        });
        router.bind("m", |_: Message, _: &str| {
            Ok::<_, HandlerError>(Message::new("second", json!(2)))
        });

        let handler = router
            .structured
            .read()
            .unwrap()
            .get("m")
            .cloned()
            .unwrap();
        let reply = handler
            .call(Message::new("m", json!(null)), "s")
            .unwrap()
            .unwrap();
        assert_eq!(reply.name, "second");
    }

    #[test]
    fn structured_and_raw_maps_are_disjoint() {
        let router = Router::default();
        router.bind("echo", echo_structured);
        router.bind_raw("echo", |body: Bytes, _: &str| Ok::<_, HandlerError>(body));

        assert!(router.is_bound("echo"));
        assert!(router.is_bound_raw("echo"));

        router.unbind("echo");
        assert!(!router.is_bound("echo"));
        assert!(router.is_bound_raw("echo"));
    }

    #[test]
    fn unbind_of_unknown_name_is_a_no_op() {
        let router = Router::default();
        router.unbind("nope");
        router.unbind_raw("nope");
    }

    #[test]
    fn one_way_closures_bind() {
        let router = Router::default();
        router.bind("notify", |_: Message, _: &str| Ok::<_, HandlerError>(()));
        router.bind_raw("notify", |_: Bytes, _: &str| Ok::<_, HandlerError>(()));
        assert!(router.is_bound("notify"));
        assert!(router.is_bound_raw("notify"));
    }
}
