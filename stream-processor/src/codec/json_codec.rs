use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, CodecError, DecodedKv, EncodedKv};

/// UTF-8 keys with JSON-encoded values of type `V`.
#[derive(Debug)]
pub struct JsonCodec<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Codec for JsonCodec<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Key = String;
    type Value = V;

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<DecodedKv<String, V>, CodecError> {
        let key = String::from_utf8(key.to_vec()).map_err(CodecError::InvalidKey)?;
        let value = serde_json::from_slice(value).map_err(CodecError::Deserialize)?;
        Ok(DecodedKv::new(key, value))
    }

    fn encode(&self, key: &String, value: &V) -> Result<EncodedKv, CodecError> {
        let value = serde_json::to_vec(value).map_err(CodecError::Serialize)?;
        Ok(EncodedKv::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::from(value),
        ))
    }
}
