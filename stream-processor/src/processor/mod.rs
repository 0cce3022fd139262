//! Simple processor - binds topic definitions to partitions
//!
//! The processor supervises the partition manager, an optional auxiliary runnable, the
//! commit drain (when commits are buffered) and one task per live partition. A fatal
//! error from any of them tears everything down and is returned from [`SimpleProcessor::run`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kv_store::KvStore;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::codec::Codec;
use crate::config::{CommitMode, Config};
use crate::consumer::Consumer;
use crate::error::ProcessorError;
use crate::partition::Partition;
use crate::partition_manager::{ManagerOutputs, PartitionManager};
use crate::runnable::Runnable;

mod commit;
mod offset_pick;
mod retry;
mod topic;

pub use commit::{
    offset_key, CommitStrategy, ConsumerCommitter, KvStoreCommitter, OffsetCommitter,
};
pub use offset_pick::{KvStoreOffsetPicker, OffsetPicker, StoredOffsetPicker};
pub use retry::RetryPolicy;
pub use topic::{
    HandlerResult, ProcessorContext, ProcessorHandle, SharedObject, TopicDefinition, TopicHandler,
};

use commit::{drain_commits, CommitSink};
use topic::TopicPartitionHandler;

type TaskResult = Result<(), ProcessorError>;

pub struct SimpleProcessor<C: Codec> {
    consumer: Arc<dyn Consumer>,
    manager: Arc<PartitionManager<C>>,
    outputs: Mutex<Option<ManagerOutputs<C>>>,
    auxiliary: Option<Arc<dyn Runnable>>,
    topics: HashMap<String, TopicDefinition<C>>,
    commit_strategy: CommitStrategy,
    offset_picker: Arc<dyn OffsetPicker>,
    processor_object: Option<SharedObject>,
    config: Config,
    token: CancellationToken,
    span: Span,
}

impl<C: Codec> SimpleProcessor<C> {
    pub fn new(
        consumer: Arc<dyn Consumer>,
        auxiliary: Option<Arc<dyn Runnable>>,
        topics: Vec<TopicDefinition<C>>,
    ) -> Result<Self, ProcessorError> {
        Self::with_config(consumer, auxiliary, topics, Config::default())
    }

    /// Fails with [`ProcessorError::TopicExists`] when a topic name repeats; otherwise
    /// subscribes `consumer` to exactly the defined topics.
    pub fn with_config(
        consumer: Arc<dyn Consumer>,
        auxiliary: Option<Arc<dyn Runnable>>,
        topics: Vec<TopicDefinition<C>>,
        config: Config,
    ) -> Result<Self, ProcessorError> {
        let mut names = Vec::with_capacity(topics.len());
        let mut bound = HashMap::with_capacity(topics.len());
        for definition in topics {
            if bound.contains_key(&definition.name) {
                return Err(ProcessorError::TopicExists(definition.name));
            }
            names.push(definition.name.clone());
            bound.insert(definition.name.clone(), definition);
        }

        let (manager, outputs) =
            PartitionManager::with_errors_buffer(consumer.clone(), config.partition_errors_buffer())?;
        for (name, definition) in &bound {
            manager.set_codec(name.clone(), definition.codec.clone());
        }
        consumer.subscribe(&names)?;
        info!(topics = ?names, "Subscribed to topics");

        let default_committer: Arc<dyn OffsetCommitter> =
            Arc::new(ConsumerCommitter::new(consumer.clone()));
        let commit_strategy = match config.commit_mode {
            CommitMode::Inline => CommitStrategy::Inline(default_committer),
            CommitMode::Async => CommitStrategy::AsyncBuffered {
                committer: default_committer,
                buffer: config.commit_buffer_size(),
            },
        };

        Ok(Self {
            consumer,
            manager: Arc::new(manager),
            outputs: Mutex::new(Some(outputs)),
            auxiliary,
            topics: bound,
            commit_strategy,
            offset_picker: Arc::new(StoredOffsetPicker),
            processor_object: None,
            config,
            token: CancellationToken::new(),
            span: tracing::info_span!("simple_processor"),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn commit_strategy(&self) -> &CommitStrategy {
        &self.commit_strategy
    }

    pub fn set_commit_behavior(&mut self, committer: Arc<dyn OffsetCommitter>) {
        self.commit_strategy = CommitStrategy::Inline(committer);
    }

    pub fn set_default_commit_behavior(&mut self) {
        self.set_commit_behavior(Arc::new(ConsumerCommitter::new(self.consumer.clone())));
    }

    pub fn set_async_commit_behavior(&mut self, committer: Arc<dyn OffsetCommitter>, buffer: usize) {
        self.commit_strategy = CommitStrategy::AsyncBuffered {
            committer,
            buffer: buffer.max(1),
        };
    }

    pub fn set_async_default_commit_behavior(&mut self, buffer: usize) {
        let committer = Arc::new(ConsumerCommitter::new(self.consumer.clone()));
        self.set_async_commit_behavior(committer, buffer);
    }

    pub fn set_kv_store_commit(&mut self, store: Arc<dyn KvStore>) {
        let committer = KvStoreCommitter::new(store, self.config.offset_key_prefix.clone());
        self.set_commit_behavior(Arc::new(committer));
    }

    pub fn set_async_kv_store_commit(&mut self, store: Arc<dyn KvStore>, buffer: usize) {
        let committer = KvStoreCommitter::new(store, self.config.offset_key_prefix.clone());
        self.set_async_commit_behavior(Arc::new(committer), buffer);
    }

    pub fn set_offset_pick_behavior(&mut self, picker: Arc<dyn OffsetPicker>) {
        self.offset_picker = picker;
    }

    pub fn set_kv_store_offset_pick(&mut self, store: Arc<dyn KvStore>) {
        let picker = KvStoreOffsetPicker::new(store, self.config.offset_key_prefix.clone());
        self.set_offset_pick_behavior(Arc::new(picker));
    }

    /// Commits to and resumes from `store`.
    pub fn set_kv_store_behavior(&mut self, store: Arc<dyn KvStore>) {
        self.set_kv_store_commit(store.clone());
        self.set_kv_store_offset_pick(store);
    }

    pub fn set_async_kv_store_behavior(&mut self, store: Arc<dyn KvStore>, buffer: usize) {
        self.set_async_kv_store_commit(store.clone(), buffer);
        self.set_kv_store_offset_pick(store);
    }

    /// Data every handler can reach through [`ProcessorContext::processor_object`].
    pub fn set_object<T: Any + Send + Sync>(&mut self, object: T) {
        self.processor_object = Some(Arc::new(object));
    }

    pub fn close(&self) {
        self.token.cancel();
        self.manager.close();
    }

    /// The handle every [`ProcessorContext`] of this processor carries.
    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle::new(self.token.clone())
    }

    pub async fn run(&self) -> Result<(), ProcessorError> {
        let outputs = match self.outputs.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let ManagerOutputs {
            mut created,
            mut removed,
            mut errors,
        } = outputs.ok_or(ProcessorError::AlreadyRunning)?;

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let manager_task = self.spawn_manager(&mut tasks);
        self.spawn_auxiliary(&mut tasks);
        let sink = Arc::new(self.start_commit_sink(&mut tasks));

        info!(parent: &self.span, "Processor started");
        let result = loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next_with_id() => match joined {
                    Ok((id, Ok(()))) if id == manager_task => {
                        info!(parent: &self.span, "Partition manager stopped");
                        break Ok(());
                    }
                    Ok((_, Ok(()))) => {}
                    Ok((_, Err(e))) if !e.is_fatal() => {
                        warn!(parent: &self.span, error = ?e, "Partition stopped");
                    }
                    Ok((_, Err(e))) => {
                        error!(parent: &self.span, error = ?e, "Processor task failed");
                        break Err(e);
                    }
                    Err(e) => {
                        error!(parent: &self.span, error = ?e, "Processor task panicked");
                        break Err(ProcessorError::TaskPanicked(e.to_string()));
                    }
                },
                Some(partition) = created.recv() => self.start_partition(partition, &sink, &mut tasks),
                Some(handle) = removed.recv() => {
                    info!(parent: &self.span, partition = %handle.topic_partition(), "Closing revoked partition");
                    handle.close();
                }
                Some(e) = errors.recv() => {
                    warn!(parent: &self.span, error = %e, "Partition manager reported an error");
                }
            }
        };

        self.shutdown(tasks).await;
        info!(parent: &self.span, "Processor stopped");
        result
    }

    fn spawn_manager(&self, tasks: &mut JoinSet<TaskResult>) -> Id {
        let manager = self.manager.clone();
        tasks
            .spawn(
                async move { manager.run().await.map_err(ProcessorError::from) }
                    .instrument(self.span.clone()),
            )
            .id()
    }

    fn spawn_auxiliary(&self, tasks: &mut JoinSet<TaskResult>) {
        let Some(auxiliary) = self.auxiliary.clone() else {
            return;
        };
        tasks.spawn(
            async move {
                if let Err(e) = auxiliary.run().await {
                    warn!(error = ?e, "Auxiliary runnable failed");
                }
                Ok(())
            }
            .instrument(tracing::info_span!(parent: &self.span, "auxiliary")),
        );
    }

    fn start_commit_sink(&self, tasks: &mut JoinSet<TaskResult>) -> CommitSink {
        match &self.commit_strategy {
            CommitStrategy::Inline(committer) => CommitSink::Inline(committer.clone()),
            CommitStrategy::AsyncBuffered { committer, buffer } => {
                let (queue_tx, queue_rx) = mpsc::channel((*buffer).max(1));
                tasks.spawn(
                    drain_commits(committer.clone(), queue_rx, self.token.clone())
                        .instrument(tracing::info_span!(parent: &self.span, "commit_drain")),
                );
                CommitSink::Queued(queue_tx)
            }
        }
    }

    fn start_partition(
        &self,
        mut partition: Partition<C>,
        sink: &Arc<CommitSink>,
        tasks: &mut JoinSet<TaskResult>,
    ) {
        let tp = partition.topic_partition().clone();
        let Some(definition) = self.topics.get(tp.topic()) else {
            debug!(parent: &self.span, partition = %tp, "Ignoring partition of unknown topic");
            return;
        };

        partition.set_codec(definition.codec.clone());
        partition.set_handler(Arc::new(TopicPartitionHandler::new(
            ProcessorHandle::new(self.token.clone()),
            definition.handler.clone(),
            definition.object.clone(),
            self.processor_object.clone(),
            self.config.retry_policy(),
        )));
        partition.set_commit_handler(sink.clone());

        let picker = self.offset_picker.clone();
        let span = tracing::info_span!(parent: &self.span, "partition", partition = %tp);
        tasks.spawn(
            async move {
                let offset = picker.pick_offset(&tp).await?;
                let mut partition = partition.with_span(Span::current());
                partition.set_offset(offset);
                partition.run().await?;
                Ok(())
            }
            .instrument(span),
        );
    }

    async fn shutdown(&self, mut tasks: JoinSet<TaskResult>) {
        self.manager.close();
        if let Some(auxiliary) = &self.auxiliary {
            auxiliary.close().await;
        }
        self.token.cancel();

        let wait_all = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(parent: &self.span, error = ?e, "Task failed during shutdown"),
                    Err(e) => warn!(parent: &self.span, error = ?e, "Task panicked during shutdown"),
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), wait_all)
            .await
            .is_err()
        {
            warn!(
                parent: &self.span,
                remaining = tasks.len(),
                "Timed out waiting for tasks, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[async_trait]
impl<C: Codec> Runnable for SimpleProcessor<C> {
    async fn run(&self) -> anyhow::Result<()> {
        SimpleProcessor::run(self).await?;
        Ok(())
    }

    async fn close(&self) {
        SimpleProcessor::close(self);
    }
}
