//! Codec boundary between raw transport bytes and domain values.

use bytes::Bytes;
use thiserror::Error;

mod json_codec;
mod string_codec;

pub use json_codec::JsonCodec;
pub use string_codec::StringCodec;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message key is not valid utf-8")]
    InvalidKey(#[source] std::string::FromUtf8Error),
    #[error("message value is not valid utf-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
    #[error("message value could not be deserialized")]
    Deserialize(#[source] serde_json::Error),
    #[error("message value could not be serialized")]
    Serialize(#[source] serde_json::Error),
}

/// A message after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKv<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> DecodedKv<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// A message as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedKv {
    pub key: Bytes,
    pub value: Bytes,
}

impl EncodedKv {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Translates raw message bytes to typed keys and values and back.
///
/// Each topic is bound to one codec instance; a processor that consumes several kinds of
/// payloads uses a codec whose `Value` is an enum over them.
pub trait Codec: Send + Sync + 'static {
    type Key: Send + Sync + 'static;
    type Value: Send + Sync + 'static;

    fn decode(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<DecodedKv<Self::Key, Self::Value>, CodecError>;

    fn encode(&self, key: &Self::Key, value: &Self::Value) -> Result<EncodedKv, CodecError>;
}
