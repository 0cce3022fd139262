//! Partition - the pipeline of a single topic-partition
//!
//! A partition owns its inbound message channel and processes messages strictly in the
//! order they arrive:
//! 1. The starting offset is published once on the handshake channel before any message
//! 2. Each message is decoded and handed to the handler
//! 3. The commit handler fires after handling, including for messages that failed to decode

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kv_store::KvError;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::codec::{Codec, DecodedKv};
use crate::consumer::{MessageEvent, StartOffset, TopicPartition};
use crate::metrics_consts::{HANDLER_DURATION, MESSAGES_DECODE_FAILED, MESSAGES_HANDLED};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("partition {0} has no codec set")]
    NoCodec(TopicPartition),
    #[error("partition {0} has no handler set")]
    NoHandler(TopicPartition),
    #[error("handler for partition {partition} failed fatally")]
    Fatal {
        partition: TopicPartition,
        #[source]
        source: anyhow::Error,
    },
    #[error("offset store failed for partition {partition}")]
    OffsetStore {
        partition: TopicPartition,
        #[source]
        source: KvError,
    },
}

impl PartitionError {
    /// Configuration errors only affect the partition that reported them.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PartitionError::NoCodec(_) | PartitionError::NoHandler(_)
        )
    }
}

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The message is finished with and its offset may be committed
    Done,
    /// The partition was closed while the message was in flight; nothing is committed
    Interrupted,
}

#[async_trait]
pub trait PartitionHandler<C: Codec>: Send + Sync {
    async fn handle(
        &self,
        partition: &PartitionHandle,
        message: &MessageEvent,
        decoded: DecodedKv<C::Key, C::Value>,
    ) -> Result<HandleOutcome, PartitionError>;
}

#[async_trait]
pub trait CommitHandler: Send + Sync {
    async fn commit(
        &self,
        partition: &PartitionHandle,
        message: &MessageEvent,
    ) -> Result<(), PartitionError>;
}

pub struct NoopCommitHandler;

#[async_trait]
impl CommitHandler for NoopCommitHandler {
    async fn commit(&self, _: &PartitionHandle, _: &MessageEvent) -> Result<(), PartitionError> {
        Ok(())
    }
}

/// Cloneable reference to a partition that can observe and request its closing.
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    topic_partition: TopicPartition,
    token: CancellationToken,
}

impl PartitionHandle {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.topic_partition.partition_number()
    }

    /// Safe to call any number of times.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the partition has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// The ends of a partition's channels that stay with whoever feeds it.
pub struct PartitionChannels {
    pub messages: mpsc::Sender<MessageEvent>,
    pub offset: oneshot::Receiver<StartOffset>,
}

pub struct Partition<C: Codec> {
    handle: PartitionHandle,
    offset: Option<StartOffset>,
    codec: Option<Arc<C>>,
    handler: Option<Arc<dyn PartitionHandler<C>>>,
    commit_handler: Arc<dyn CommitHandler>,
    messages: mpsc::Receiver<MessageEvent>,
    offset_tx: Option<oneshot::Sender<StartOffset>>,
    span: Span,
}

impl<C: Codec> Partition<C> {
    pub fn new(topic: impl Into<String>, partition: i32) -> (Self, PartitionChannels) {
        Self::build(topic.into(), partition, CancellationToken::new())
    }

    /// A partition that is also closed when `parent` is cancelled.
    pub fn with_parent(
        topic: impl Into<String>,
        partition: i32,
        parent: &CancellationToken,
    ) -> (Self, PartitionChannels) {
        Self::build(topic.into(), partition, parent.child_token())
    }

    fn build(topic: String, partition: i32, token: CancellationToken) -> (Self, PartitionChannels) {
        // Capacity 1: the router waits on the partition, so backpressure reaches the event loop
        let (messages_tx, messages_rx) = mpsc::channel(1);
        let (offset_tx, offset_rx) = oneshot::channel();
        let span = tracing::info_span!("partition", topic = %topic, partition);

        let partition = Self {
            handle: PartitionHandle {
                topic_partition: TopicPartition::new(topic, partition),
                token,
            },
            offset: None,
            codec: None,
            handler: None,
            commit_handler: Arc::new(NoopCommitHandler),
            messages: messages_rx,
            offset_tx: Some(offset_tx),
            span,
        };
        let channels = PartitionChannels {
            messages: messages_tx,
            offset: offset_rx,
        };
        (partition, channels)
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        self.handle.topic_partition()
    }

    pub fn handle(&self) -> PartitionHandle {
        self.handle.clone()
    }

    pub fn set_codec(&mut self, codec: Arc<C>) {
        self.codec = Some(codec);
    }

    pub fn set_handler(&mut self, handler: Arc<dyn PartitionHandler<C>>) {
        self.handler = Some(handler);
    }

    pub fn set_commit_handler(&mut self, commit_handler: Arc<dyn CommitHandler>) {
        self.commit_handler = commit_handler;
    }

    pub fn set_offset(&mut self, offset: StartOffset) {
        self.offset = Some(offset);
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Processes messages until the partition is closed or its feed goes away.
    ///
    /// Fails before touching any channel when the codec or handler is missing.
    pub async fn run(&mut self) -> Result<(), PartitionError> {
        let tp = self.handle.topic_partition.clone();
        let codec = self
            .codec
            .clone()
            .ok_or_else(|| PartitionError::NoCodec(tp.clone()))?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| PartitionError::NoHandler(tp.clone()))?;

        if let Some(offset_tx) = self.offset_tx.take() {
            let offset = self.offset.unwrap_or_default();
            debug!(parent: &self.span, %offset, "Publishing start offset");
            if offset_tx.send(offset).is_err() {
                debug!(parent: &self.span, "Nobody is waiting for the start offset");
            }
        }

        info!(parent: &self.span, "Partition started");
        loop {
            let message = tokio::select! {
                biased;
                _ = self.handle.token.cancelled() => break,
                message = self.messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match self.process(&codec, &handler, &message).await? {
                HandleOutcome::Done => {}
                HandleOutcome::Interrupted => {
                    debug!(parent: &self.span, offset = message.offset, "Interrupted while handling message");
                    break;
                }
            }
        }
        info!(parent: &self.span, "Partition stopped");
        Ok(())
    }

    async fn process(
        &self,
        codec: &Arc<C>,
        handler: &Arc<dyn PartitionHandler<C>>,
        message: &MessageEvent,
    ) -> Result<HandleOutcome, PartitionError> {
        match codec.decode(&message.key, &message.value) {
            Ok(decoded) => {
                let started = Instant::now();
                let outcome = handler.handle(&self.handle, message, decoded).await?;
                metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());
                metrics::counter!(MESSAGES_HANDLED).increment(1);
                if outcome == HandleOutcome::Interrupted {
                    return Ok(outcome);
                }
            }
            Err(e) => {
                warn!(
                    parent: &self.span,
                    offset = message.offset,
                    error = ?e,
                    "Failed to decode message, skipping handler"
                );
                metrics::counter!(MESSAGES_DECODE_FAILED).increment(1);
            }
        }

        self.commit_handler.commit(&self.handle, message).await?;
        Ok(HandleOutcome::Done)
    }
}
