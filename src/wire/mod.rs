//! Wire-level types: frame headers, client flags, and protocol constants.
//!
//! All header fields are 4-byte unsigned integers encoded little-endian.
//! The original protocol wrote headers in native byte order via memcpy;
//! standardising on little-endian keeps heterogeneous deployments working
//! while remaining byte-identical on the common platforms.

mod frame;
pub use frame::{FrameError, PushFrame, RequestFrame, ResponseFrame};

/// Hard cap on the sum of payload lengths in a single frame.
///
/// A frame whose payload exceeds this is fatal for the connection that
/// produced or received it.
pub const MAX_FRAME: usize = 20 * 1024 * 1024;

/// Period of the subscriber-side heartbeat timer.
pub const HEARTBEAT_PERIOD_MS: u64 = 3000;

/// How long callers keep retrying the initial TCP connect, and how long a
/// server connection may stay silent before the liveness sweep drops it.
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Interval of the server-side liveness sweep.
pub const CHECK_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Reserved protocol name (and body) for heartbeat frames. The server
/// recognises it in the subscriber arm of the router and silently drops it.
pub const HEARTBEAT_FLAG: &str = "00";

/// Body of a SUBSCRIBER-role control frame requesting a subscription.
pub const SUBSCRIBE_FLAG: &str = "1";

/// Body of a SUBSCRIBER-role control frame cancelling a subscription.
pub const CANCEL_SUBSCRIBE_FLAG: &str = "0";

/// Whether a payload is routed through the codec registry or passed as
/// opaque bytes. Selects which router/broker map a name is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SerializeMode {
    /// Payload is a codec-encoded message; the frame carries a message name.
    Structured = 0,
    /// Payload is opaque bytes; the message name is empty.
    Raw = 1,
}

impl SerializeMode {
    pub(crate) fn from_u32(raw: u32) -> Result<Self, FrameError> {
        match raw {
            0 => Ok(Self::Structured),
            1 => Ok(Self::Raw),
            _ => Err(FrameError::InvalidField("serialize-mode", raw)),
        }
    }
}

/// The role a client connection declares on every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientRole {
    /// Synchronous caller: one request-response pair in flight.
    Rpc = 0,
    /// Asynchronous caller: many in-flight calls correlated by call-id.
    AsyncRpc = 1,
    /// Publisher: fire-and-forget frames fanned out by the broker.
    Publisher = 2,
    /// Subscriber: control frames and heartbeats; receives push frames.
    Subscriber = 3,
}

impl ClientRole {
    pub(crate) fn from_u32(raw: u32) -> Result<Self, FrameError> {
        match raw {
            0 => Ok(Self::Rpc),
            1 => Ok(Self::AsyncRpc),
            2 => Ok(Self::Publisher),
            3 => Ok(Self::Subscriber),
            _ => Err(FrameError::InvalidField("client-role", raw)),
        }
    }
}

/// The `(serialize_mode, client_role)` pair carried in every request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlag {
    /// Codec path and router map to consult.
    pub mode: SerializeMode,
    /// Flow the frame belongs to.
    pub role: ClientRole,
}

impl ClientFlag {
    /// Create a new flag.
    pub const fn new(mode: SerializeMode, role: ClientRole) -> Self {
        Self { mode, role }
    }
}

/// Wire error-code space for response frames.
///
/// The core reserves 0 and 1; further codes extend the space. Unknown
/// values are carried through rather than rejected, so peers running a
/// newer revision stay interoperable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The call succeeded.
    Ok,
    /// No handler bound for the protocol name in the requested mode.
    RouteFailed,
    /// The call expired before a response arrived.
    Timeout,
    /// The handler (or the codec invoked on its behalf) failed.
    HandlerFailed,
    /// A code this revision does not know about.
    Other(u32),
}

impl ErrorCode {
    pub(crate) const fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::RouteFailed,
            2 => Self::Timeout,
            3 => Self::HandlerFailed,
            other => Self::Other(other),
        }
    }

    pub(crate) const fn as_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::RouteFailed => 1,
            Self::Timeout => 2,
            Self::HandlerFailed => 3,
            Self::Other(raw) => raw,
        }
    }

    /// Whether this code signals success.
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::RouteFailed => f.write_str("route failed"),
            Self::HandlerFailed => f.write_str("handler failed"),
            Self::Timeout => f.write_str("timed out"),
            Self::Other(raw) => write!(f, "error code {raw}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::RouteFailed,
            ErrorCode::HandlerFailed,
            ErrorCode::Timeout,
            ErrorCode::Other(17),
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn rejects_unknown_flag_fields() {
        assert!(SerializeMode::from_u32(2).is_err());
        assert!(ClientRole::from_u32(4).is_err());
    }
}
