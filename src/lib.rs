//! murmur: a lightweight RPC and publish/subscribe framework over TCP.
//!
//! A single [`Server`] accepts connections from four client roles —
//! synchronous RPC ([`RpcClient`]), asynchronous RPC ([`AsyncRpcClient`]),
//! publisher ([`PubClient`]), and subscriber ([`SubClient`]). Inbound
//! requests are dispatched through a name-keyed router to user-registered
//! handlers running on a worker pool; published messages fan out to
//! matching subscribers with FIFO ordering per subscriber.
//!
//! ## Serving
//!
//! Handlers come in two modes. Structured handlers receive payloads decoded
//! through the server's [`CodecRegistry`]; raw handlers receive opaque
//! bytes. The two live in disjoint maps, so the same name may be bound in
//! both.
//!
//! ```no_run
//! use murmur::{HandlerError, Message, Server};
//! use bytes::Bytes;
//!
//! let mut server = Server::new()
//!     // A raw echo method.
//!     .bind_raw("echo", |body: Bytes, _session: &str| {
//!         Ok::<_, HandlerError>(body)
//!     })
//!     // A structured method; the registry decodes and re-encodes.
//!     .bind("request_person_info", |req: Message, session: &str| {
//!         println!("session id: {session}");
//!         Ok::<_, HandlerError>(Message::new(
//!             "person_info_rsp",
//!             serde_json::json!({"name": "Tom", "age": 21}),
//!         ))
//!     })
//!     .listen(["127.0.0.1:50051".parse().unwrap()])
//!     .ios_threads(2)
//!     .work_threads(4);
//!
//! server.codecs().register_json("person_info_req");
//! server.codecs().register_json("person_info_rsp");
//! server.run().unwrap();
//! ```
//!
//! ## Calling
//!
//! ```no_run
//! use murmur::RpcClient;
//!
//! let client = RpcClient::new()
//!     .connect("127.0.0.1:50051".parse().unwrap())
//!     .timeout(3000);
//! let reply = client.call_raw("echo", &b"hello"[..]).unwrap();
//! assert_eq!(&reply[..], b"hello");
//! ```
//!
//! ## Publish / subscribe
//!
//! Subscribers register topic callbacks and keep their connection alive
//! with a heartbeat; on reconnect the client replays every subscription
//! before anything else goes out on the new connection. Publishers are
//! fire-and-forget.
//!
//! ```no_run
//! use murmur::{PubClient, SubClient};
//!
//! let addr = "127.0.0.1:50051".parse().unwrap();
//! let mut sub = SubClient::new().connect(addr);
//! sub.run().unwrap();
//! sub.subscribe_raw("prices", |body| println!("tick: {body:?}")).unwrap();
//!
//! let mut publisher = PubClient::new().connect(addr);
//! publisher.run().unwrap();
//! publisher.publish_raw("prices", &b"42.5"[..]).unwrap();
//! ```

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod wire;

mod codec;
pub use codec::{CodecError, CodecRegistry, JsonCodec, Message, MessageCodec};

mod error;
pub use error::{Error, HandlerError};

mod io_pool;

mod tasks;

mod workers;
pub use workers::{PoolStopped, WorkerPool};

pub mod server;
pub use server::{
    IntoRawHandler, IntoStructuredHandler, RawHandler, Server, SessionNotify, StructuredHandler,
};

pub mod client;
pub use client::{AsyncRpcClient, PubClient, RpcClient, SubClient};

/// Re-export of the `bytes` crate; raw handler and caller surfaces trade in
/// [`bytes::Bytes`].
pub use bytes;

/// Re-export of the `serde_json` crate, primarily to provide the `Value`
/// type used by structured messages.
pub use serde_json;
