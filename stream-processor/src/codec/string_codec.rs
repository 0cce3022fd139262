use bytes::Bytes;

use super::{Codec, CodecError, DecodedKv, EncodedKv};

/// UTF-8 keys and values, passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Key = String;
    type Value = String;

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<DecodedKv<String, String>, CodecError> {
        let key = String::from_utf8(key.to_vec()).map_err(CodecError::InvalidKey)?;
        let value = String::from_utf8(value.to_vec()).map_err(CodecError::InvalidUtf8)?;
        Ok(DecodedKv::new(key, value))
    }

    fn encode(&self, key: &String, value: &String) -> Result<EncodedKv, CodecError> {
        Ok(EncodedKv::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ))
    }
}
