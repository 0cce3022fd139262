//! In-memory consumer for exercising processors without a broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{Codec, CodecError};
use crate::consumer::{
    Consumer, ConsumerError, EventStreams, MessageEvent, PartitionEvent, StartOffset,
    TopicPartition,
};

#[derive(Error, Debug)]
pub enum TesterError {
    #[error("topic {0} is not subscribed")]
    UnknownTopic(String),
    #[error("partition {0} does not exist")]
    UnknownPartition(TopicPartition),
    #[error("failed to encode message")]
    Encode(#[from] CodecError),
    #[error("event streams are closed")]
    Closed,
}

pub struct TopicDescription<C: Codec> {
    pub name: String,
    pub partitions: i32,
    pub codec: Arc<C>,
}

impl<C: Codec> TopicDescription<C> {
    pub fn new(name: impl Into<String>, partitions: i32, codec: Arc<C>) -> Self {
        Self {
            name: name.into(),
            partitions,
            codec,
        }
    }
}

struct ActiveTopic {
    partitions: i32,
    total_messages: i64,
    next_offsets: HashMap<i32, i64>,
}

#[derive(Default)]
struct TesterState {
    active: HashMap<String, ActiveTopic>,
    assignments: Vec<(TopicPartition, StartOffset)>,
    commits: Vec<(TopicPartition, i64)>,
}

/// Emits one `Created` event per partition of every subscribed topic and spreads sent
/// messages round-robin over those partitions, each with its own offset sequence.
pub struct ConsumerTester<C: Codec> {
    topics: HashMap<String, TopicDescription<C>>,
    partitions_tx: Mutex<Option<mpsc::Sender<PartitionEvent>>>,
    messages_tx: Mutex<Option<mpsc::Sender<MessageEvent>>>,
    streams: Mutex<Option<EventStreams>>,
    state: Mutex<TesterState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<C: Codec> ConsumerTester<C> {
    pub fn new(topics: Vec<TopicDescription<C>>) -> Self {
        // Room for every Created event plus the same again for revocations
        let buffer: i32 = topics.iter().map(|t| t.partitions.max(0)).sum();
        let (partitions_tx, partitions) = mpsc::channel((buffer as usize * 2).max(1));
        let (messages_tx, messages) = mpsc::channel(1);

        Self {
            topics: topics.into_iter().map(|t| (t.name.clone(), t)).collect(),
            partitions_tx: Mutex::new(Some(partitions_tx)),
            messages_tx: Mutex::new(Some(messages_tx)),
            streams: Mutex::new(Some(EventStreams {
                partitions,
                messages,
            })),
            state: Mutex::new(TesterState::default()),
        }
    }

    /// Encodes and delivers a message, returning the partition and offset it landed on.
    pub async fn send_message(
        &self,
        topic: &str,
        key: &C::Key,
        value: &C::Value,
    ) -> Result<(i32, i64), TesterError> {
        let description = self
            .topics
            .get(topic)
            .ok_or_else(|| TesterError::UnknownTopic(topic.to_string()))?;
        let encoded = description.codec.encode(key, value)?;

        let (partition, offset) = {
            let mut state = lock(&self.state);
            let active = state
                .active
                .get_mut(topic)
                .ok_or_else(|| TesterError::UnknownTopic(topic.to_string()))?;
            let partition = (active.total_messages % i64::from(active.partitions)) as i32;
            active.total_messages += 1;
            let next = active.next_offsets.entry(partition).or_insert(0);
            let offset = *next;
            *next += 1;
            (partition, offset)
        };

        let sender = lock(&self.messages_tx).clone().ok_or(TesterError::Closed)?;
        sender
            .send(MessageEvent::new(topic, partition, offset, encoded.key, encoded.value))
            .await
            .map_err(|_| TesterError::Closed)?;
        debug!(topic, partition, offset, "Delivered test message");
        Ok((partition, offset))
    }

    /// Revokes a partition, as a rebalance would.
    pub async fn revoke(&self, topic: &str, partition: i32) -> Result<(), TesterError> {
        self.partition_event(PartitionEvent::destroyed(topic, partition))
            .await
    }

    /// Signals that the end of a partition was reached.
    pub async fn reach_end(&self, topic: &str, partition: i32) -> Result<(), TesterError> {
        self.partition_event(PartitionEvent::end(topic, partition))
            .await
    }

    async fn partition_event(&self, event: PartitionEvent) -> Result<(), TesterError> {
        let known = lock(&self.state)
            .active
            .get(&event.topic)
            .map(|active| (0..active.partitions).contains(&event.partition));
        match known {
            None => return Err(TesterError::UnknownTopic(event.topic)),
            Some(false) => return Err(TesterError::UnknownPartition(event.topic_partition())),
            Some(true) => {}
        }

        let sender = lock(&self.partitions_tx).clone().ok_or(TesterError::Closed)?;
        sender.send(event).await.map_err(|_| TesterError::Closed)
    }

    /// Ends both event streams.
    pub fn disconnect(&self) {
        lock(&self.partitions_tx).take();
        lock(&self.messages_tx).take();
    }

    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        lock(&self.state).commits.clone()
    }

    pub fn assignments(&self) -> Vec<(TopicPartition, StartOffset)> {
        lock(&self.state).assignments.clone()
    }
}

#[async_trait]
impl<C: Codec> Consumer for ConsumerTester<C> {
    fn take_event_streams(&self) -> Option<EventStreams> {
        lock(&self.streams).take()
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError> {
        let sender = lock(&self.partitions_tx).clone().ok_or(ConsumerError::Closed)?;
        let mut state = lock(&self.state);

        for name in topics {
            let Some(description) = self.topics.get(name) else {
                debug!(topic = %name, "Ignoring subscription to undescribed topic");
                continue;
            };
            state.active.insert(
                name.clone(),
                ActiveTopic {
                    partitions: description.partitions.max(1),
                    total_messages: 0,
                    next_offsets: HashMap::new(),
                },
            );
            for partition in 0..description.partitions.max(1) {
                sender
                    .try_send(PartitionEvent::created(name.clone(), partition))
                    .map_err(|e| ConsumerError::Broker(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn assign(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<(), ConsumerError> {
        lock(&self.state)
            .assignments
            .push((TopicPartition::new(topic, partition), offset));
        Ok(())
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ConsumerError> {
        lock(&self.state)
            .commits
            .push((TopicPartition::new(topic, partition), offset));
        Ok(())
    }
}
