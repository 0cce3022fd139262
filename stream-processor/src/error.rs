use thiserror::Error;

use crate::consumer::ConsumerError;
use crate::partition::PartitionError;
use crate::partition_manager::ManagerError;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("topic {0} is already defined")]
    TopicExists(String),
    #[error("processor is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("processor task panicked: {0}")]
    TaskPanicked(String),
}

impl ProcessorError {
    /// Whether the processor must stop. Only configuration problems of a single
    /// partition are survivable once the processor is running.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessorError::Partition(e) => e.is_fatal(),
            _ => true,
        }
    }
}
