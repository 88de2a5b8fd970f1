//! Caller-supplied payload serialization and compression.
//!
//! The heap store only moves bytes. How a value becomes bytes is a
//! [`PayloadSerializer`]; whether those bytes are shrunk first is a
//! [`CompressionCodec`].

use super::header::EntryKind;
use crate::error::{FactHeapError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Serialized form of a value, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Recorded in the entry header and handed back on read.
    pub kind: EntryKind,
    /// The bytes to store.
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Raw bytes.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EntryKind::Raw,
            bytes: bytes.into(),
        }
    }

    /// Output of a serializer.
    pub fn serialized(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EntryKind::Serialized,
            bytes: bytes.into(),
        }
    }
}

/// Turns values into payload bytes and back.
pub trait PayloadSerializer {
    /// The value type stored under a fingerprint.
    type Value;

    /// Encode a value.
    fn serialize(&self, value: &Self::Value) -> Result<Payload>;

    /// Decode bytes previously produced by `serialize`.
    fn deserialize(&self, bytes: &[u8], kind: EntryKind) -> Result<Self::Value>;
}

/// Stores byte vectors unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl PayloadSerializer for RawBytes {
    type Value = Vec<u8>;

    fn serialize(&self, value: &Vec<u8>) -> Result<Payload> {
        Ok(Payload::raw(value.clone()))
    }

    fn deserialize(&self, bytes: &[u8], _kind: EntryKind) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Stores any serde type as JSON.
#[derive(Debug)]
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    /// Create a serializer for `T`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> PayloadSerializer for JsonSerializer<T> {
    type Value = T;

    fn serialize(&self, value: &T) -> Result<Payload> {
        serde_json::to_vec(value)
            .map(Payload::serialized)
            .map_err(|e| FactHeapError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8], kind: EntryKind) -> Result<T> {
        if kind != EntryKind::Serialized {
            return Err(FactHeapError::Serialization(
                "entry holds raw bytes, not a serialized value".to_string(),
            ));
        }
        serde_json::from_slice(bytes).map_err(|e| FactHeapError::Serialization(e.to_string()))
    }
}

/// Optional byte transform applied to payloads before they reach the heap.
pub trait CompressionCodec: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Compress `input`. `None` means "store uncompressed".
    fn compress(&self, input: &[u8]) -> Option<Vec<u8>>;

    /// Restore bytes produced by `compress`.
    fn decompress(&self, input: &[u8], original_len: usize) -> Result<Vec<u8>>;
}

/// Never compresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl CompressionCodec for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, _input: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn decompress(&self, _input: &[u8], original_len: usize) -> Result<Vec<u8>> {
        Err(FactHeapError::Compression {
            cause: format!(
                "entry is compressed ({original_len} bytes original) but no codec is installed"
            ),
        })
    }
}
