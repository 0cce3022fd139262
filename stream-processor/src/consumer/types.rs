use std::fmt;

use bytes::Bytes;

use crate::codec::EncodedKv;

/// Identity of a partition: the key under which at most one live `Partition` exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    topic: String,
    partition_number: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEventKind {
    /// The partition was assigned to this consumer
    Created,
    /// The partition was revoked from this consumer
    Destroyed,
    /// The consumer reached the current end of the partition
    End,
}

/// Partition lifecycle notification emitted by a [`Consumer`](super::Consumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEvent {
    pub kind: PartitionEventKind,
    pub topic: String,
    pub partition: i32,
}

impl PartitionEvent {
    pub fn new(kind: PartitionEventKind, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            kind,
            topic: topic.into(),
            partition,
        }
    }

    pub fn created(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(PartitionEventKind::Created, topic, partition)
    }

    pub fn destroyed(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(PartitionEventKind::Destroyed, topic, partition)
    }

    pub fn end(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(PartitionEventKind::End, topic, partition)
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A raw message delivered by a [`Consumer`](super::Consumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
}

impl MessageEvent {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn encoded(&self) -> EncodedKv {
        EncodedKv::new(self.key.clone(), self.value.clone())
    }
}

/// Where a newly assigned partition should start consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// Whatever offset the broker has committed for the consumer group
    #[default]
    Stored,
    Earliest,
    Latest,
    Exact(i64),
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Stored => write!(f, "stored"),
            StartOffset::Earliest => write!(f, "earliest"),
            StartOffset::Latest => write!(f, "latest"),
            StartOffset::Exact(offset) => write!(f, "{offset}"),
        }
    }
}
