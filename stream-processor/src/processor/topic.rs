use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::{Codec, DecodedKv, EncodedKv};
use crate::consumer::{MessageEvent, TopicPartition};
use crate::metrics_consts::HANDLER_RETRIES;
use crate::partition::{HandleOutcome, PartitionError, PartitionHandle, PartitionHandler};

use super::retry::RetryPolicy;

/// Opaque user data attached to a topic or to the whole processor.
pub type SharedObject = Arc<dyn Any + Send + Sync>;

/// What a topic handler wants done with the message it was given.
#[derive(Debug)]
pub enum HandlerResult {
    /// Handled; commit and move on
    Continue,
    /// Could not be handled but is not worth retrying; logged, committed and skipped
    Skip(anyhow::Error),
    /// Hand the same message to the handler again after a backoff
    Retry(Option<anyhow::Error>),
    /// Unrecoverable; stops the processor
    Fatal(anyhow::Error),
}

#[async_trait]
pub trait TopicHandler<C: Codec>: Send + Sync {
    async fn handle(
        &self,
        ctx: &ProcessorContext,
        message: &DecodedKv<C::Key, C::Value>,
    ) -> HandlerResult;
}

/// Lets a handler stop the processor that is running it.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    token: CancellationToken,
}

impl ProcessorHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stops the processor; its `run` returns once every task is torn down.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Everything a handler can see besides the decoded message.
pub struct ProcessorContext {
    processor: ProcessorHandle,
    partition: PartitionHandle,
    encoded: EncodedKv,
    offset: i64,
    attempt: u32,
    topic_object: Option<SharedObject>,
    processor_object: Option<SharedObject>,
}

impl ProcessorContext {
    pub fn processor(&self) -> &ProcessorHandle {
        &self.processor
    }

    pub fn partition(&self) -> &PartitionHandle {
        &self.partition
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        self.partition.topic_partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The raw key and value exactly as they were consumed.
    pub fn encoded(&self) -> &EncodedKv {
        &self.encoded
    }

    /// 0 on the first attempt, incremented on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn topic_object<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.topic_object.as_ref()?.downcast_ref::<T>()
    }

    pub fn processor_object<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.processor_object.as_ref()?.downcast_ref::<T>()
    }
}

/// A topic bound to its codec, handler and optional user object.
pub struct TopicDefinition<C: Codec> {
    pub name: String,
    pub codec: Arc<C>,
    pub handler: Arc<dyn TopicHandler<C>>,
    pub object: Option<SharedObject>,
}

impl<C: Codec> TopicDefinition<C> {
    pub fn new(name: impl Into<String>, codec: Arc<C>, handler: Arc<dyn TopicHandler<C>>) -> Self {
        Self {
            name: name.into(),
            codec,
            handler,
            object: None,
        }
    }

    pub fn with_object<T: Any + Send + Sync>(mut self, object: T) -> Self {
        self.object = Some(Arc::new(object));
        self
    }
}

/// Runs a [`TopicHandler`] for one partition, turning its results into partition outcomes.
pub(crate) struct TopicPartitionHandler<C: Codec> {
    processor: ProcessorHandle,
    handler: Arc<dyn TopicHandler<C>>,
    topic_object: Option<SharedObject>,
    processor_object: Option<SharedObject>,
    retry_policy: RetryPolicy,
}

impl<C: Codec> TopicPartitionHandler<C> {
    pub(crate) fn new(
        processor: ProcessorHandle,
        handler: Arc<dyn TopicHandler<C>>,
        topic_object: Option<SharedObject>,
        processor_object: Option<SharedObject>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            processor,
            handler,
            topic_object,
            processor_object,
            retry_policy,
        }
    }
}

#[async_trait]
impl<C: Codec> PartitionHandler<C> for TopicPartitionHandler<C> {
    async fn handle(
        &self,
        partition: &PartitionHandle,
        message: &MessageEvent,
        decoded: DecodedKv<C::Key, C::Value>,
    ) -> Result<HandleOutcome, PartitionError> {
        let mut ctx = ProcessorContext {
            processor: self.processor.clone(),
            partition: partition.clone(),
            encoded: message.encoded(),
            offset: message.offset,
            attempt: 0,
            topic_object: self.topic_object.clone(),
            processor_object: self.processor_object.clone(),
        };

        loop {
            match self.handler.handle(&ctx, &decoded).await {
                HandlerResult::Continue => return Ok(HandleOutcome::Done),
                HandlerResult::Skip(e) => {
                    warn!(offset = message.offset, error = ?e, "Handler skipped message");
                    return Ok(HandleOutcome::Done);
                }
                HandlerResult::Fatal(e) => {
                    error!(offset = message.offset, error = ?e, "Handler failed fatally");
                    return Err(PartitionError::Fatal {
                        partition: partition.topic_partition().clone(),
                        source: e,
                    });
                }
                HandlerResult::Retry(e) => {
                    ctx.attempt += 1;
                    metrics::counter!(HANDLER_RETRIES).increment(1);
                    let backoff = self.retry_policy.retry_interval(ctx.attempt);
                    match e {
                        Some(e) => warn!(
                            offset = message.offset,
                            attempt = ctx.attempt,
                            error = ?e,
                            "Handler asked to retry message"
                        ),
                        None => debug!(
                            offset = message.offset,
                            attempt = ctx.attempt,
                            "Handler asked to retry message"
                        ),
                    }

                    tokio::select! {
                        biased;
                        _ = partition.closed() => return Ok(HandleOutcome::Interrupted),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
