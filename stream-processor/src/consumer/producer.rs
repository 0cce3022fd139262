use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::codec::{Codec, CodecError};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to encode message for topic {topic}")]
    Encode {
        topic: String,
        #[source]
        source: CodecError,
    },
    #[error("failed to deliver message to topic {topic}: {reason}")]
    Delivery { topic: String, reason: String },
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, topic: &str, key: Bytes, value: Bytes) -> Result<(), ProducerError>;
}

/// Sends typed values to a single topic through a codec.
pub struct TopicProducer<C: Codec> {
    producer: Arc<dyn Producer>,
    codec: Arc<C>,
    topic: String,
}

impl<C: Codec> TopicProducer<C> {
    pub fn new(topic: impl Into<String>, codec: Arc<C>, producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            codec,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn send(&self, key: &C::Key, value: &C::Value) -> Result<(), ProducerError> {
        let encoded = self
            .codec
            .encode(key, value)
            .map_err(|source| ProducerError::Encode {
                topic: self.topic.clone(),
                source,
            })?;

        debug!(
            topic = %self.topic,
            key_bytes = encoded.key.len(),
            value_bytes = encoded.value.len(),
            "Producing message"
        );
        self.producer
            .send(&self.topic, encoded.key, encoded.value)
            .await
    }
}
