//! Command payload value model.
//!
//! Payloads are opaque to the protocol core: the main process and the daemon
//! agree on their shape per command kind. The value space covers the nested
//! primitives the wire format must round-trip: strings, numbers, byte blobs,
//! ordered sequences and key/value mappings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A nested primitive value carried by a command or reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes (torrent info hashes, thumbnails, ...).
    Blob(Vec<u8>),
    /// Ordered sequence.
    List(Vec<Payload>),
    /// Key/value mapping with deterministic ordering.
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Builds a map payload from key/value pairs.
    pub fn map(entries: impl IntoIterator<Item = (String, Payload)>) -> Self {
        Payload::Map(entries.into_iter().collect())
    }

    /// Returns the text content, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an `Int` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the mapping, if this is a `Map` value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Looks a key up in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.as_map().and_then(|map| map.get(key))
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Int(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Float(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Blob(value)
    }
}
