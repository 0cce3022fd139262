use std::sync::Arc;

use async_trait::async_trait;
use kv_store::{KvError, KvStore};
use tracing::{debug, error, warn};

use crate::consumer::{StartOffset, TopicPartition};
use crate::partition::PartitionError;

use super::commit::offset_key;

/// Decides where a newly assigned partition starts consuming.
#[async_trait]
pub trait OffsetPicker: Send + Sync {
    async fn pick_offset(&self, tp: &TopicPartition) -> Result<StartOffset, PartitionError>;
}

/// Leaves the choice to the consumer group's committed offset.
pub struct StoredOffsetPicker;

#[async_trait]
impl OffsetPicker for StoredOffsetPicker {
    async fn pick_offset(&self, _: &TopicPartition) -> Result<StartOffset, PartitionError> {
        Ok(StartOffset::Stored)
    }
}

/// Resumes right after the offset a [`KvStoreCommitter`](super::KvStoreCommitter) last wrote.
pub struct KvStoreOffsetPicker {
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl KvStoreOffsetPicker {
    pub fn new(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl OffsetPicker for KvStoreOffsetPicker {
    async fn pick_offset(&self, tp: &TopicPartition) -> Result<StartOffset, PartitionError> {
        let key = offset_key(&self.key_prefix, tp.topic());
        let field = tp.partition_number().to_string();

        let stored = match self.store.hget(&key, &field).await {
            Ok(stored) => stored,
            Err(KvError::KeyNotExists) => {
                debug!(partition = %tp, "No stored offset, using the consumer group offset");
                return Ok(StartOffset::Stored);
            }
            Err(e) if e.is_fatal() => {
                error!(partition = %tp, error = ?e, "Offset store is unusable");
                return Err(PartitionError::OffsetStore {
                    partition: tp.clone(),
                    source: e,
                });
            }
            Err(e) => {
                warn!(partition = %tp, error = ?e, "Failed to read stored offset, using the consumer group offset");
                return Ok(StartOffset::Stored);
            }
        };

        match stored.trim().parse::<i64>() {
            Ok(offset) => Ok(StartOffset::Exact(offset + 1)),
            Err(e) => {
                warn!(partition = %tp, stored = %stored, error = ?e, "Stored offset is not a number, using the consumer group offset");
                Ok(StartOffset::Stored)
            }
        }
    }
}
