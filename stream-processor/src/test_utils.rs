//! Recording doubles for the broker-facing contracts, shared by unit and integration tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{Codec, DecodedKv};
use crate::consumer::{
    Consumer, ConsumerError, EventStreams, MessageEvent, PartitionEvent, Producer, ProducerError,
    StartOffset,
};
use crate::partition::{HandleOutcome, PartitionError, PartitionHandle, PartitionHandler};

const EVENT_BUFFER: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether it held.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockConsumerCall {
    Subscribe(Vec<String>),
    Assign {
        topic: String,
        partition: i32,
        offset: StartOffset,
    },
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

/// A consumer whose events are pushed by the test and whose requests are recorded.
pub struct MockConsumer {
    partitions_tx: Mutex<Option<mpsc::Sender<PartitionEvent>>>,
    messages_tx: Mutex<Option<mpsc::Sender<MessageEvent>>>,
    streams: Mutex<Option<EventStreams>>,
    calls: Arc<Mutex<Vec<MockConsumerCall>>>,
    commit_error: Mutex<Option<String>>,
    assign_error: Mutex<Option<String>>,
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsumer {
    pub fn new() -> Self {
        let (partitions_tx, partitions) = mpsc::channel(EVENT_BUFFER);
        let (messages_tx, messages) = mpsc::channel(EVENT_BUFFER);
        Self {
            partitions_tx: Mutex::new(Some(partitions_tx)),
            messages_tx: Mutex::new(Some(messages_tx)),
            streams: Mutex::new(Some(EventStreams {
                partitions,
                messages,
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
            commit_error: Mutex::new(None),
            assign_error: Mutex::new(None),
        }
    }

    pub fn fail_commits(&self, reason: &str) {
        *lock(&self.commit_error) = Some(reason.to_string());
    }

    pub fn fail_assigns(&self, reason: &str) {
        *lock(&self.assign_error) = Some(reason.to_string());
    }

    pub async fn emit(&self, event: PartitionEvent) {
        let sender = lock(&self.partitions_tx).clone();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                debug!("Partition event stream is no longer read");
            }
        }
    }

    pub async fn send_message(&self, message: MessageEvent) {
        let sender = lock(&self.messages_tx).clone();
        if let Some(sender) = sender {
            if sender.send(message).await.is_err() {
                debug!("Message stream is no longer read");
            }
        }
    }

    /// Ends both event streams, as a consumer that lost its broker would.
    pub fn disconnect(&self) {
        lock(&self.partitions_tx).take();
        lock(&self.messages_tx).take();
    }

    pub fn calls(&self) -> Vec<MockConsumerCall> {
        lock(&self.calls).clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                MockConsumerCall::Subscribe(topics) => Some(topics.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                MockConsumerCall::Commit {
                    topic,
                    partition,
                    offset,
                } => Some((topic.clone(), *partition, *offset)),
                _ => None,
            })
            .collect()
    }

    pub fn assignments(&self) -> Vec<(String, i32, StartOffset)> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                MockConsumerCall::Assign {
                    topic,
                    partition,
                    offset,
                } => Some((topic.clone(), *partition, *offset)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    fn take_event_streams(&self) -> Option<EventStreams> {
        lock(&self.streams).take()
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError> {
        lock(&self.calls).push(MockConsumerCall::Subscribe(topics.to_vec()));
        Ok(())
    }

    async fn assign(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<(), ConsumerError> {
        lock(&self.calls).push(MockConsumerCall::Assign {
            topic: topic.to_string(),
            partition,
            offset,
        });
        match lock(&self.assign_error).clone() {
            Some(reason) => Err(ConsumerError::Broker(reason)),
            None => Ok(()),
        }
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ConsumerError> {
        lock(&self.calls).push(MockConsumerCall::Commit {
            topic: topic.to_string(),
            partition,
            offset,
        });
        match lock(&self.commit_error).clone() {
            Some(reason) => Err(ConsumerError::Broker(reason)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub topic: String,
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Default)]
pub struct MockProducer {
    sent: Mutex<Vec<SentMessage>>,
    failure: Option<String>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A producer whose every send fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(reason.to_string()),
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Producer for MockProducer {
    async fn send(&self, topic: &str, key: Bytes, value: Bytes) -> Result<(), ProducerError> {
        if let Some(reason) = &self.failure {
            return Err(ProducerError::Delivery {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }
        lock(&self.sent).push(SentMessage {
            topic: topic.to_string(),
            key,
            value,
        });
        Ok(())
    }
}

/// Accepts every message without looking at it.
pub struct NoopPartitionHandler;

#[async_trait]
impl<C: Codec> PartitionHandler<C> for NoopPartitionHandler {
    async fn handle(
        &self,
        _: &PartitionHandle,
        _: &MessageEvent,
        _: DecodedKv<C::Key, C::Value>,
    ) -> Result<HandleOutcome, PartitionError> {
        Ok(HandleOutcome::Done)
    }
}
