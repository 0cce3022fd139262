//! Offset commit strategies.
//!
//! A committer records that a message has been handled. The strategy decides on which
//! task that happens: inline on the partition's own task, or through a bounded queue
//! drained by a single dedicated task.

use std::sync::Arc;

use async_trait::async_trait;
use kv_store::KvStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::consumer::{Consumer, MessageEvent, TopicPartition};
use crate::error::ProcessorError;
use crate::metrics_consts::{OFFSETS_COMMITTED, OFFSET_COMMIT_FAILURES};
use crate::partition::{CommitHandler, PartitionError, PartitionHandle};

/// Hash key under which the offsets of every partition of `topic` are stored.
pub fn offset_key(prefix: &str, topic: &str) -> String {
    format!("{prefix}{topic}")
}

#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit_offset(&self, tp: &TopicPartition, offset: i64)
        -> Result<(), PartitionError>;
}

/// Commits through the consumer group. Failures are logged; the next commit of the
/// partition supersedes a lost one.
pub struct ConsumerCommitter {
    consumer: Arc<dyn Consumer>,
}

impl ConsumerCommitter {
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl OffsetCommitter for ConsumerCommitter {
    async fn commit_offset(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), PartitionError> {
        match self
            .consumer
            .commit(tp.topic(), tp.partition_number(), offset)
            .await
        {
            Ok(()) => metrics::counter!(OFFSETS_COMMITTED).increment(1),
            Err(e) => {
                warn!(partition = %tp, offset, error = ?e, "Failed to commit offset");
                metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
            }
        }
        Ok(())
    }
}

/// Persists offsets in a key-value store, one hash per topic keyed by partition number.
pub struct KvStoreCommitter {
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl KvStoreCommitter {
    pub fn new(store: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl OffsetCommitter for KvStoreCommitter {
    async fn commit_offset(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), PartitionError> {
        let key = offset_key(&self.key_prefix, tp.topic());
        let field = tp.partition_number().to_string();

        match self.store.hset(&key, &field, offset.to_string()).await {
            Ok(()) => {
                metrics::counter!(OFFSETS_COMMITTED).increment(1);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(partition = %tp, offset, error = ?e, "Offset store is unusable");
                Err(PartitionError::OffsetStore {
                    partition: tp.clone(),
                    source: e,
                })
            }
            Err(e) => {
                warn!(partition = %tp, offset, error = ?e, "Failed to store offset");
                metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
                Ok(())
            }
        }
    }
}

/// How handled offsets reach their committer. The most recent configuration wins.
#[derive(Clone)]
pub enum CommitStrategy {
    Inline(Arc<dyn OffsetCommitter>),
    AsyncBuffered {
        committer: Arc<dyn OffsetCommitter>,
        buffer: usize,
    },
}

impl CommitStrategy {
    pub fn is_async(&self) -> bool {
        matches!(self, CommitStrategy::AsyncBuffered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitRequest {
    pub tp: TopicPartition,
    pub offset: i64,
}

/// The commit handler every partition of a running processor shares.
pub(crate) enum CommitSink {
    Inline(Arc<dyn OffsetCommitter>),
    Queued(mpsc::Sender<CommitRequest>),
}

#[async_trait]
impl CommitHandler for CommitSink {
    async fn commit(
        &self,
        partition: &PartitionHandle,
        message: &MessageEvent,
    ) -> Result<(), PartitionError> {
        let tp = partition.topic_partition();
        match self {
            CommitSink::Inline(committer) => committer.commit_offset(tp, message.offset).await,
            CommitSink::Queued(queue) => {
                let request = CommitRequest {
                    tp: tp.clone(),
                    offset: message.offset,
                };
                if queue.send(request).await.is_err() {
                    warn!(partition = %tp, offset = message.offset, "Commit queue is closed, dropping commit");
                }
                Ok(())
            }
        }
    }
}

/// Commits queued offsets in order until cancelled, then commits what is still queued.
pub(crate) async fn drain_commits(
    committer: Arc<dyn OffsetCommitter>,
    mut queue: mpsc::Receiver<CommitRequest>,
    token: CancellationToken,
) -> Result<(), ProcessorError> {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => committer.commit_offset(&request.tp, request.offset).await?,
                None => return Ok(()),
            },
        }
    }

    queue.close();
    let mut drained = 0usize;
    while let Some(request) = queue.recv().await {
        committer.commit_offset(&request.tp, request.offset).await?;
        drained += 1;
    }
    debug!(drained, "Commit queue drained");
    Ok(())
}
