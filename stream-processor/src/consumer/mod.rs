//! Contracts of the broker-facing collaborators.
//!
//! Concrete clients live outside this crate. A [`Consumer`] hands out its two event
//! streams once, to whichever `PartitionManager` drives it, and otherwise only receives
//! subscribe/assign/commit requests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

mod producer;
mod types;

pub use producer::{Producer, ProducerError, TopicProducer};
pub use types::{MessageEvent, PartitionEvent, PartitionEventKind, StartOffset, TopicPartition};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("topic {0} is not known to the consumer")]
    UnknownTopic(String),
    #[error("consumer event stream is closed")]
    Closed,
    #[error("broker request failed: {0}")]
    Broker(String),
}

/// The two streams a consumer emits. Partition events and messages travel separately so
/// that a stalled partition never hides a rebalance notification.
pub struct EventStreams {
    pub partitions: mpsc::Receiver<PartitionEvent>,
    pub messages: mpsc::Receiver<MessageEvent>,
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Hands out the event streams. Returns `None` once they have been taken.
    fn take_event_streams(&self) -> Option<EventStreams>;

    fn subscribe(&self, topics: &[String]) -> Result<(), ConsumerError>;

    /// Start consuming `partition` of `topic` from `offset`.
    async fn assign(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<(), ConsumerError>;

    /// Record `offset` as processed for the consumer group.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ConsumerError>;
}
