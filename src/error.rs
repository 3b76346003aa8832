use crate::{
    codec::CodecError,
    wire::{ErrorCode, FrameError},
};
use std::time::Duration;

/// Failures surfaced to callers. Every failing operation returns one of
/// these explicitly; there are no sentinel values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connect retry loop ran past its deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// A synchronous call expired. The connection was closed to abort the
    /// outstanding read; the next call reconnects.
    #[error("call timed out")]
    Timeout,
    /// The peer answered with a non-OK wire code.
    #[error("server error: {0}")]
    Rpc(ErrorCode),
    /// Framing failure on this connection; the connection is closed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Encoding or decoding a structured payload failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The underlying transport failed; the connection is closed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The client was used before `run()` or after `stop()`.
    #[error("client is not running")]
    NotRunning,
    /// The connection went away while the operation was queued.
    #[error("connection closed")]
    Closed,
}

/// Failure signalled by a user handler. Reaches the caller as a response
/// with the handler-failed wire code and an empty body.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message. The message is logged on the
    /// server; only the wire code crosses to the caller.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self::new(msg)
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        Self(err.to_string())
    }
}
