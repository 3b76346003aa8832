//! The codec boundary: message-name-keyed encoding of structured payloads.
//!
//! The framework never interprets structured bodies itself. A frame carries
//! a textual message name; the [`CodecRegistry`] maps that name to a
//! [`MessageCodec`] which converts between wire bytes and the in-memory
//! value. The in-memory value is [`serde_json::Value`] — embedders that
//! need a different representation implement [`MessageCodec`] over their
//! own serialization and register it per message name.

use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

/// Errors crossing the codec boundary.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No codec registered under the message name.
    #[error("no codec registered for message {0:?}")]
    UnknownMessage(String),
    /// The shipped JSON codec failed to encode or decode.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    /// A custom codec failed.
    #[error("{0}")]
    Custom(String),
}

/// A named, structured payload: the codec key plus the decoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The codec key identifying the payload's schema.
    pub name: String,
    /// The decoded payload.
    pub value: Value,
}

impl Message {
    /// Create a message.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Converts one message schema between wire bytes and its in-memory value.
///
/// Implementations must satisfy `encode(decode(body)) == body` for valid
/// inputs.
pub trait MessageCodec: Send + Sync + 'static {
    /// Produce wire bytes from a value.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    /// Reconstruct the value from wire bytes.
    fn decode(&self, body: &[u8]) -> Result<Value, CodecError>;
}

/// The shipped codec: payloads are the JSON text of the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Name-keyed codec lookup, shared by a server or client instance.
///
/// Registration replaces; lookup of an unregistered name is a
/// [`CodecError::UnknownMessage`].
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn MessageCodec>>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codecs = self.codecs.read().expect("codec registry lock poisoned");
        f.debug_struct("CodecRegistry")
            .field("messages", &codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec under a message name, replacing any prior one.
    pub fn register(&self, name: impl Into<String>, codec: impl MessageCodec) {
        self.codecs
            .write()
            .expect("codec registry lock poisoned")
            .insert(name.into(), Arc::new(codec));
    }

    /// Register the shipped [`JsonCodec`] under a message name.
    pub fn register_json(&self, name: impl Into<String>) {
        self.register(name, JsonCodec);
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn MessageCodec>, CodecError> {
        self.codecs
            .read()
            .expect("codec registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownMessage(name.to_owned()))
    }

    /// Encode a value under the codec registered for `name`.
    pub fn encode(&self, name: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.lookup(name)?.encode(value)
    }

    /// Decode wire bytes under the codec registered for `name`.
    pub fn decode(&self, name: &str, body: &[u8]) -> Result<Value, CodecError> {
        self.lookup(name)?.decode(body)
    }

    /// Decode a full message.
    pub fn decode_message(&self, name: &str, body: &[u8]) -> Result<Message, CodecError> {
        Ok(Message::new(name, self.decode(name, body)?))
    }
}
