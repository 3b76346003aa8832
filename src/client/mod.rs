//! Caller-side clients, one per role.
//!
//! All four clients front an internal single-thread reactor with a
//! blocking API, so they can live in any application without requiring an
//! async runtime at the call site. Each owns its own codec registry and —
//! where callbacks are delivered — a worker pool, so independent clients
//! never share mutable state.

pub(crate) mod shared;

mod rpc;
pub use rpc::RpcClient;

mod async_rpc;
pub use async_rpc::{AsyncRpcClient, CallBuilder, ConnectNotify, RawCallBuilder};

mod subscriber;
pub use subscriber::SubClient;

mod publisher;
pub use publisher::PubClient;
