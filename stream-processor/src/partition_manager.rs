//! Partition manager - bridges consumer events to live partitions
//!
//! The manager owns the map of live partitions; only its event loop reads or mutates it.
//! For every assigned partition it spawns a short-lived runner that hands the new
//! [`Partition`] to whoever reads `created`, waits for the partition's start offset and
//! relays it to the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::codec::Codec;
use crate::config::MIN_PARTITION_ERRORS_BUFFER;
use crate::consumer::{
    Consumer, EventStreams, MessageEvent, PartitionEvent, PartitionEventKind, StartOffset,
    TopicPartition,
};
use crate::metrics_consts::{LIVE_PARTITIONS, MESSAGES_DROPPED_NOT_LIVE};
use crate::partition::{Partition, PartitionHandle};
use crate::runnable::Runnable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no codec registered for the topic of partition {0}")]
    NoCodec(TopicPartition),
    #[error("partition {0} is not live")]
    NoPartition(TopicPartition),
    #[error("partition {0} is already live")]
    PartitionExists(TopicPartition),
    #[error("consumer event streams were already taken")]
    StreamsUnavailable,
    #[error("partition manager is already running")]
    AlreadyRunning,
}

/// Output streams of a [`PartitionManager`]. `created` and `removed` are blocking
/// handoffs: a reader that stops draining them stalls the manager.
pub struct ManagerOutputs<C: Codec> {
    pub created: mpsc::Receiver<Partition<C>>,
    pub removed: mpsc::Receiver<PartitionHandle>,
    pub errors: mpsc::Receiver<ManagerError>,
}

struct LivePartition {
    messages: mpsc::Sender<MessageEvent>,
    handle: PartitionHandle,
    runner: CancellationToken,
}

pub struct PartitionManager<C: Codec> {
    consumer: Arc<dyn Consumer>,
    codecs: RwLock<HashMap<String, Arc<C>>>,
    streams: Mutex<Option<EventStreams>>,
    created_tx: mpsc::Sender<Partition<C>>,
    removed_tx: mpsc::Sender<PartitionHandle>,
    errors_tx: mpsc::Sender<ManagerError>,
    token: CancellationToken,
    span: Span,
}

impl<C: Codec> PartitionManager<C> {
    pub fn new(consumer: Arc<dyn Consumer>) -> Result<(Self, ManagerOutputs<C>), ManagerError> {
        Self::with_errors_buffer(consumer, MIN_PARTITION_ERRORS_BUFFER)
    }

    /// Takes the consumer's event streams; fails if another manager already holds them.
    pub fn with_errors_buffer(
        consumer: Arc<dyn Consumer>,
        errors_buffer: usize,
    ) -> Result<(Self, ManagerOutputs<C>), ManagerError> {
        let streams = consumer
            .take_event_streams()
            .ok_or(ManagerError::StreamsUnavailable)?;

        let (created_tx, created) = mpsc::channel(1);
        let (removed_tx, removed) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(errors_buffer.max(MIN_PARTITION_ERRORS_BUFFER));

        let manager = Self {
            consumer,
            codecs: RwLock::new(HashMap::new()),
            streams: Mutex::new(Some(streams)),
            created_tx,
            removed_tx,
            errors_tx,
            token: CancellationToken::new(),
            span: tracing::info_span!("partition_manager"),
        };
        let outputs = ManagerOutputs {
            created,
            removed,
            errors,
        };
        Ok((manager, outputs))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Binds `topic` to `codec`. Partitions of unbound topics are never created.
    pub fn set_codec(&self, topic: impl Into<String>, codec: Arc<C>) {
        let mut codecs = match self.codecs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        codecs.insert(topic.into(), codec);
    }

    fn codec_for(&self, topic: &str) -> Option<Arc<C>> {
        let codecs = match self.codecs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        codecs.get(topic).cloned()
    }

    fn take_streams(&self) -> Option<EventStreams> {
        let mut streams: MutexGuard<'_, Option<EventStreams>> = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        streams.take()
    }

    /// Closing also closes every partition the manager created.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs the event loop until closed or until the consumer's streams end.
    pub async fn run(&self) -> Result<(), ManagerError> {
        let EventStreams {
            mut partitions,
            mut messages,
        } = self.take_streams().ok_or(ManagerError::AlreadyRunning)?;
        let mut live: HashMap<TopicPartition, LivePartition> = HashMap::new();

        info!(parent: &self.span, "Partition manager started");
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = partitions.recv() => match event {
                    Some(event) => self.on_partition_event(event, &mut live).await,
                    None => {
                        info!(parent: &self.span, "Partition event stream ended");
                        break;
                    }
                },
                message = messages.recv() => match message {
                    Some(message) => self.route(message, &live).await,
                    None => {
                        info!(parent: &self.span, "Message stream ended");
                        break;
                    }
                },
            }
        }

        self.token.cancel();
        metrics::gauge!(LIVE_PARTITIONS).set(0.0);
        info!(parent: &self.span, live_partitions = live.len(), "Partition manager stopped");
        Ok(())
    }

    async fn on_partition_event(
        &self,
        event: PartitionEvent,
        live: &mut HashMap<TopicPartition, LivePartition>,
    ) {
        match event.kind {
            PartitionEventKind::Created => self.on_created(event, live).await,
            PartitionEventKind::Destroyed => self.on_destroyed(event, live).await,
            PartitionEventKind::End => {
                debug!(
                    parent: &self.span,
                    topic = %event.topic,
                    partition = event.partition,
                    "Reached end of partition"
                );
            }
        }
    }

    async fn on_created(
        &self,
        event: PartitionEvent,
        live: &mut HashMap<TopicPartition, LivePartition>,
    ) {
        let tp = event.topic_partition();
        let Some(codec) = self.codec_for(&event.topic) else {
            self.report(ManagerError::NoCodec(tp)).await;
            return;
        };
        if live.contains_key(&tp) {
            self.report(ManagerError::PartitionExists(tp)).await;
            return;
        }

        let (mut partition, channels) =
            Partition::with_parent(event.topic, event.partition, &self.token);
        partition.set_codec(codec);
        let runner = self.token.child_token();

        live.insert(
            tp.clone(),
            LivePartition {
                messages: channels.messages,
                handle: partition.handle(),
                runner: runner.clone(),
            },
        );
        metrics::gauge!(LIVE_PARTITIONS).set(live.len() as f64);
        info!(parent: &self.span, partition = %tp, "Partition assigned");

        let span = tracing::info_span!(parent: &self.span, "partition_runner", partition = %tp);
        tokio::spawn(
            relay_start_offset(
                self.consumer.clone(),
                self.created_tx.clone(),
                partition,
                channels.offset,
                self.token.clone(),
                runner,
            )
            .instrument(span),
        );
    }

    async fn on_destroyed(
        &self,
        event: PartitionEvent,
        live: &mut HashMap<TopicPartition, LivePartition>,
    ) {
        let tp = event.topic_partition();
        let Some(removed) = live.remove(&tp) else {
            self.report(ManagerError::NoPartition(tp)).await;
            return;
        };
        removed.runner.cancel();
        metrics::gauge!(LIVE_PARTITIONS).set(live.len() as f64);
        info!(parent: &self.span, partition = %tp, "Partition revoked");

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            res = self.removed_tx.send(removed.handle) => {
                if res.is_err() {
                    debug!(parent: &self.span, partition = %tp, "Nobody is reading removed partitions");
                }
            }
        }
    }

    async fn route(&self, message: MessageEvent, live: &HashMap<TopicPartition, LivePartition>) {
        let tp = message.topic_partition();
        let Some(partition) = live.get(&tp) else {
            debug!(
                parent: &self.span,
                partition = %tp,
                offset = message.offset,
                "Dropping message for partition that is not live"
            );
            metrics::counter!(MESSAGES_DROPPED_NOT_LIVE, "topic" => tp.topic().to_string())
                .increment(1);
            return;
        };

        let offset = message.offset;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            res = partition.messages.send(message) => {
                if res.is_err() {
                    debug!(parent: &self.span, partition = %tp, offset, "Partition stopped before receiving message");
                    metrics::counter!(MESSAGES_DROPPED_NOT_LIVE, "topic" => tp.topic().to_string())
                        .increment(1);
                }
            }
        }
    }

    async fn report(&self, error: ManagerError) {
        warn!(parent: &self.span, error = %error, "Partition event rejected");
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            res = self.errors_tx.send(error) => {
                if res.is_err() {
                    debug!(parent: &self.span, "Nobody is reading manager errors");
                }
            }
        }
    }
}

/// Hands `partition` to the `created` reader, then relays its start offset to the consumer.
///
/// Only closing the manager abandons the handoff; a partition revoked before the reader
/// took it is still delivered.
async fn relay_start_offset<C: Codec>(
    consumer: Arc<dyn Consumer>,
    created: mpsc::Sender<Partition<C>>,
    partition: Partition<C>,
    offset: oneshot::Receiver<StartOffset>,
    manager: CancellationToken,
    runner: CancellationToken,
) {
    let tp = partition.topic_partition().clone();

    tokio::select! {
        biased;
        _ = manager.cancelled() => return,
        res = created.send(partition) => {
            if res.is_err() {
                debug!("Nobody is reading created partitions");
                return;
            }
        }
    }

    let offset = tokio::select! {
        biased;
        _ = runner.cancelled() => return,
        offset = offset => match offset {
            Ok(offset) => offset,
            Err(_) => {
                debug!("Partition dropped before publishing its start offset");
                return;
            }
        },
    };

    debug!(%offset, "Assigning partition");
    if let Err(e) = consumer
        .assign(tp.topic(), tp.partition_number(), offset)
        .await
    {
        warn!(error = ?e, %offset, "Failed to assign partition");
    }
}

#[async_trait]
impl<C: Codec> Runnable for PartitionManager<C> {
    async fn run(&self) -> anyhow::Result<()> {
        PartitionManager::run(self).await?;
        Ok(())
    }

    async fn close(&self) {
        PartitionManager::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodedKv, StringCodec};
    use crate::partition::{HandleOutcome, PartitionError, PartitionHandler};
    use crate::test_utils::{MockConsumer, MockConsumerCall};
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn manager(
        consumer: &Arc<MockConsumer>,
        topics: &[&str],
    ) -> (Arc<PartitionManager<StringCodec>>, ManagerOutputs<StringCodec>) {
        let (manager, outputs) = PartitionManager::new(consumer.clone()).unwrap();
        for topic in topics {
            manager.set_codec(*topic, Arc::new(StringCodec));
        }
        (Arc::new(manager), outputs)
    }

    fn spawn_run(
        manager: &Arc<PartitionManager<StringCodec>>,
    ) -> tokio::task::JoinHandle<Result<(), ManagerError>> {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    }

    #[tokio::test]
    async fn test_streams_can_only_be_taken_once() {
        let consumer = Arc::new(MockConsumer::new());
        let (_first, _outputs) = manager(&consumer, &[]);

        let second = PartitionManager::<StringCodec>::new(consumer.clone());
        assert!(matches!(second, Err(ManagerError::StreamsUnavailable)));
    }

    #[tokio::test]
    async fn test_created_event_emits_partition_and_assigns_offset() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        consumer.emit(PartitionEvent::created("orders", 1)).await;
        let mut partition = timeout(WAIT, outputs.created.recv()).await.unwrap().unwrap();
        assert_eq!(partition.topic_partition(), &TopicPartition::new("orders", 1));

        partition.set_offset(StartOffset::Exact(12));
        partition.set_handler(Arc::new(crate::test_utils::NoopPartitionHandler));
        let handle = partition.handle();
        let partition_task = tokio::spawn(async move { partition.run().await });

        assert!(
            crate::test_utils::wait_until(WAIT, || {
                consumer.calls().contains(&MockConsumerCall::Assign {
                    topic: "orders".to_string(),
                    partition: 1,
                    offset: StartOffset::Exact(12),
                })
            })
            .await
        );

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        timeout(WAIT, partition_task).await.unwrap().unwrap().unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_created_event_for_unbound_topic_reports_no_codec() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        consumer.emit(PartitionEvent::created("payments", 0)).await;

        let error = timeout(WAIT, outputs.errors.recv()).await.unwrap().unwrap();
        assert_eq!(error, ManagerError::NoCodec(TopicPartition::new("payments", 0)));
        assert!(outputs.created.try_recv().is_err());

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_destroyed_event_for_unknown_partition_reports_no_partition() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        consumer.emit(PartitionEvent::destroyed("orders", 3)).await;

        let error = timeout(WAIT, outputs.errors.recv()).await.unwrap().unwrap();
        assert_eq!(error, ManagerError::NoPartition(TopicPartition::new("orders", 3)));
        assert!(outputs.removed.try_recv().is_err());

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_created_event_reports_partition_exists() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        consumer.emit(PartitionEvent::created("orders", 0)).await;
        let _partition = timeout(WAIT, outputs.created.recv()).await.unwrap().unwrap();
        consumer.emit(PartitionEvent::created("orders", 0)).await;

        let error = timeout(WAIT, outputs.errors.recv()).await.unwrap().unwrap();
        assert_eq!(error, ManagerError::PartitionExists(TopicPartition::new("orders", 0)));

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_created_then_destroyed_emits_each_once() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        for partition in 0..3 {
            consumer.emit(PartitionEvent::created("orders", partition)).await;
            let created = timeout(WAIT, outputs.created.recv()).await.unwrap().unwrap();
            assert_eq!(created.topic_partition().partition_number(), partition);
        }
        consumer.emit(PartitionEvent::destroyed("orders", 1)).await;
        let removed = timeout(WAIT, outputs.removed.recv()).await.unwrap().unwrap();
        assert_eq!(removed.topic_partition(), &TopicPartition::new("orders", 1));

        // A second revoke of the same key is no longer live
        consumer.emit(PartitionEvent::destroyed("orders", 1)).await;
        let error = timeout(WAIT, outputs.errors.recv()).await.unwrap().unwrap();
        assert_eq!(error, ManagerError::NoPartition(TopicPartition::new("orders", 1)));
        assert!(outputs.created.try_recv().is_err());
        assert!(outputs.removed.try_recv().is_err());

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_revoke_before_created_is_drained_still_emits_partition() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["orders"]);
        let task = spawn_run(&manager);

        // Nobody reads `created` until both partitions exist and one is revoked
        consumer.emit(PartitionEvent::created("orders", 1)).await;
        consumer.emit(PartitionEvent::created("orders", 0)).await;
        consumer.emit(PartitionEvent::destroyed("orders", 0)).await;

        let removed = timeout(WAIT, outputs.removed.recv()).await.unwrap().unwrap();
        assert_eq!(removed.topic_partition(), &TopicPartition::new("orders", 0));

        let mut created = Vec::new();
        for _ in 0..2 {
            let partition = timeout(WAIT, outputs.created.recv()).await.unwrap().unwrap();
            created.push(partition.topic_partition().to_string());
        }
        created.sort();
        assert_eq!(created, vec!["orders:0", "orders:1"]);
        assert!(outputs.removed.try_recv().is_err());

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(TopicPartition, i64)>>,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<(TopicPartition, i64)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PartitionHandler<StringCodec> for RecordingHandler {
        async fn handle(
            &self,
            _: &PartitionHandle,
            message: &MessageEvent,
            _: DecodedKv<String, String>,
        ) -> Result<HandleOutcome, PartitionError> {
            self.seen
                .lock()
                .unwrap()
                .push((message.topic_partition(), message.offset));
            Ok(HandleOutcome::Done)
        }
    }

    fn dropped_messages(snapshotter: &Snapshotter, topic: &str) -> u64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| {
                key.key().name() == MESSAGES_DROPPED_NOT_LIVE
                    && key
                        .key()
                        .labels()
                        .any(|label| label.key() == "topic" && label.value() == topic)
            })
            .and_then(|(_, _, _, value)| match value {
                DebugValue::Counter(count) => Some(count),
                _ => None,
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_messages_reach_live_partitions_only() {
        static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
        let snapshotter = SNAPSHOTTER.get_or_init(|| {
            let recorder = DebuggingRecorder::new();
            let snapshotter = recorder.snapshotter();
            drop(recorder.install());
            snapshotter
        });

        let consumer = Arc::new(MockConsumer::new());
        let (manager, mut outputs) = manager(&consumer, &["inventory"]);
        let task = spawn_run(&manager);
        let handler = Arc::new(RecordingHandler::default());

        let mut partition_tasks = Vec::new();
        for partition in 0..2 {
            consumer.emit(PartitionEvent::created("inventory", partition)).await;
            let mut partition = timeout(WAIT, outputs.created.recv()).await.unwrap().unwrap();
            partition.set_handler(handler.clone());
            partition_tasks.push(tokio::spawn(async move { partition.run().await }));
        }

        consumer
            .send_message(MessageEvent::new("inventory", 0, 0, "k", "v"))
            .await;
        consumer
            .send_message(MessageEvent::new("inventory", 9, 0, "k", "v"))
            .await;
        consumer
            .send_message(MessageEvent::new("inventory", 0, 1, "k", "v"))
            .await;

        consumer.emit(PartitionEvent::destroyed("inventory", 0)).await;
        let removed = timeout(WAIT, outputs.removed.recv()).await.unwrap().unwrap();
        assert_eq!(removed.topic_partition(), &TopicPartition::new("inventory", 0));
        consumer
            .send_message(MessageEvent::new("inventory", 0, 2, "k", "v"))
            .await;
        consumer.emit(PartitionEvent::end("inventory", 1)).await;
        // Routed after the revoked message, so once it is handled the drop has happened
        consumer
            .send_message(MessageEvent::new("inventory", 1, 0, "k", "v"))
            .await;

        let tp0 = TopicPartition::new("inventory", 0);
        let tp1 = TopicPartition::new("inventory", 1);
        assert!(
            crate::test_utils::wait_until(WAIT, || {
                let seen = handler.seen();
                seen.contains(&(tp0.clone(), 1)) && seen.contains(&(tp1.clone(), 0))
            })
            .await
        );

        let seen = handler.seen();
        let partition_0: Vec<i64> = seen
            .iter()
            .filter(|(tp, _)| *tp == tp0)
            .map(|(_, offset)| *offset)
            .collect();
        assert_eq!(partition_0, vec![0, 1]);
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(tp, _)| tp.partition_number() != 9));
        assert_eq!(dropped_messages(snapshotter, "inventory"), 2);

        manager.close();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        for partition_task in partition_tasks {
            timeout(WAIT, partition_task).await.unwrap().unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, _outputs) = manager(&consumer, &[]);
        manager.close();

        timeout(WAIT, manager.run()).await.unwrap().unwrap();
        assert_eq!(manager.run().await, Err(ManagerError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_stream_end_stops_manager() {
        let consumer = Arc::new(MockConsumer::new());
        let (manager, _outputs) = manager(&consumer, &[]);
        let task = spawn_run(&manager);

        consumer.disconnect();

        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert!(manager.is_closed());
    }
}
