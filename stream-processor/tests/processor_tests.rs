use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kv_store::mock::MockKvStore;
use kv_store::{KvError, KvStore, MemoryKvStore};
use stream_processor::partition::PartitionError;
use stream_processor::processor::{offset_key, CommitStrategy};
use stream_processor::runnable::Runnable;
use stream_processor::tester::{ConsumerTester, TopicDescription};
use stream_processor::test_utils::wait_until;
use stream_processor::{
    DecodedKv, HandlerResult, ProcessorContext, ProcessorError, SimpleProcessor, StartOffset,
    StringCodec, TopicDefinition, TopicHandler, TopicPartition,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(i32, i64, String, String)>>,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<(i32, i64, String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicHandler<StringCodec> for RecordingHandler {
    async fn handle(&self, ctx: &ProcessorContext, message: &DecodedKv<String, String>) -> HandlerResult {
        self.seen.lock().unwrap().push((
            ctx.topic_partition().partition_number(),
            ctx.offset(),
            message.key.clone(),
            message.value.clone(),
        ));
        HandlerResult::Continue
    }
}

struct FailOnValue(&'static str);

#[async_trait]
impl TopicHandler<StringCodec> for FailOnValue {
    async fn handle(&self, _: &ProcessorContext, message: &DecodedKv<String, String>) -> HandlerResult {
        if message.value == self.0 {
            HandlerResult::Fatal(anyhow::anyhow!("refusing {}", message.value))
        } else {
            HandlerResult::Continue
        }
    }
}

struct StopOnValue(&'static str);

#[async_trait]
impl TopicHandler<StringCodec> for StopOnValue {
    async fn handle(&self, ctx: &ProcessorContext, message: &DecodedKv<String, String>) -> HandlerResult {
        if message.value == self.0 {
            ctx.processor().close();
        }
        HandlerResult::Continue
    }
}

struct BrokenAuxiliary;

#[async_trait]
impl Runnable for BrokenAuxiliary {
    async fn run(&self) -> anyhow::Result<()> {
        anyhow::bail!("auxiliary could not start")
    }

    async fn close(&self) {}
}

fn tester(partitions: i32) -> Arc<ConsumerTester<StringCodec>> {
    Arc::new(ConsumerTester::new(vec![TopicDescription::new(
        "orders",
        partitions,
        Arc::new(StringCodec),
    )]))
}

fn orders(handler: Arc<dyn TopicHandler<StringCodec>>) -> Vec<TopicDefinition<StringCodec>> {
    vec![TopicDefinition::new("orders", Arc::new(StringCodec), handler)]
}

fn spawn(
    processor: SimpleProcessor<StringCodec>,
) -> (
    Arc<SimpleProcessor<StringCodec>>,
    JoinHandle<Result<(), ProcessorError>>,
) {
    let processor = Arc::new(processor);
    let running = processor.clone();
    let task = tokio::spawn(async move { running.run().await });
    (processor, task)
}

async fn send(tester: &ConsumerTester<StringCodec>, key: &str, value: &str) -> (i32, i64) {
    timeout(
        WAIT,
        tester.send_message("orders", &key.to_string(), &value.to_string()),
    )
    .await
    .unwrap()
    .unwrap()
}

fn committed_offsets(tester: &ConsumerTester<StringCodec>) -> Vec<i64> {
    tester.commits().into_iter().map(|(_, offset)| offset).collect()
}

#[tokio::test]
async fn test_orders_are_handled_and_committed_in_order() {
    let tester = tester(1);
    let handler = Arc::new(RecordingHandler::default());
    let processor = SimpleProcessor::new(tester.clone(), None, orders(handler.clone())).unwrap();
    let (processor, task) = spawn(processor);

    for i in 0..3 {
        send(&tester, &format!("k{i}"), &format!("order {i}")).await;
    }
    assert!(wait_until(WAIT, || tester.commits().len() == 3).await);

    let keys: Vec<String> = handler.seen().into_iter().map(|(_, _, k, _)| k).collect();
    assert_eq!(keys, vec!["k0", "k1", "k2"]);
    assert_eq!(committed_offsets(&tester), vec![0, 1, 2]);
    assert!(
        wait_until(WAIT, || {
            tester.assignments() == vec![(TopicPartition::new("orders", 0), StartOffset::Stored)]
        })
        .await
    );

    processor.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_async_buffered_commits_keep_partition_order() {
    let tester = tester(2);
    let handler = Arc::new(RecordingHandler::default());
    let mut processor =
        SimpleProcessor::new(tester.clone(), None, orders(handler.clone())).unwrap();
    processor.set_async_default_commit_behavior(2);
    assert!(processor.commit_strategy().is_async());
    let (processor, task) = spawn(processor);

    for i in 0..6 {
        send(&tester, &format!("k{i}"), "v").await;
    }
    assert!(wait_until(WAIT, || tester.commits().len() == 6).await);

    for partition in 0..2 {
        let offsets: Vec<i64> = tester
            .commits()
            .into_iter()
            .filter(|(tp, _)| tp.partition_number() == partition)
            .map(|(_, offset)| offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }
    assert_eq!(handler.seen().len(), 6);

    processor.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_kv_store_behavior_resumes_after_stored_offset() {
    let tester = tester(1);
    let store = Arc::new(MemoryKvStore::new());
    let key = offset_key("stream_processor_", "orders");
    store.hset(&key, "0", "9".to_string()).await.unwrap();

    let mut processor = SimpleProcessor::new(
        tester.clone(),
        None,
        orders(Arc::new(RecordingHandler::default())),
    )
    .unwrap();
    processor.set_kv_store_behavior(store.clone());
    assert!(matches!(processor.commit_strategy(), CommitStrategy::Inline(_)));
    let (processor, task) = spawn(processor);

    assert!(
        wait_until(WAIT, || {
            tester.assignments() == vec![(TopicPartition::new("orders", 0), StartOffset::Exact(10))]
        })
        .await
    );

    send(&tester, "k0", "v").await;
    send(&tester, "k1", "v").await;
    let store_reader = store.clone();
    let mut stored = String::new();
    for _ in 0..500 {
        stored = store_reader.hget(&key, "0").await.unwrap();
        if stored == "1" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored, "1");
    // Offsets went to the store, not the consumer group
    assert!(tester.commits().is_empty());

    processor.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_kv_connection_during_commit_stops_processor() {
    let tester = tester(1);
    let key = offset_key("stream_processor_", "orders");
    let store = MockKvStore::new().hset_ret(&key, Err(KvError::ConnectionDropped));

    let mut processor = SimpleProcessor::new(
        tester.clone(),
        None,
        orders(Arc::new(RecordingHandler::default())),
    )
    .unwrap();
    processor.set_async_kv_store_behavior(Arc::new(store), 4);
    let (_processor, task) = spawn(processor);

    send(&tester, "k0", "v").await;

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    match result {
        Err(ProcessorError::Partition(PartitionError::OffsetStore { source, .. })) => {
            assert_eq!(source, KvError::ConnectionDropped)
        }
        other => panic!("expected offset store failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreadable_offset_store_stops_processor_before_assign() {
    let tester = tester(1);
    let key = offset_key("stream_processor_", "orders");
    let store = MockKvStore::new().hget_ret(&key, Err(KvError::Unclassified("EOF".to_string())));

    let mut processor = SimpleProcessor::new(
        tester.clone(),
        None,
        orders(Arc::new(RecordingHandler::default())),
    )
    .unwrap();
    processor.set_kv_store_offset_pick(Arc::new(store));
    let (_processor, task) = spawn(processor);

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(ProcessorError::Partition(PartitionError::OffsetStore { .. }))
    ));
    assert!(tester.assignments().is_empty());
}

#[tokio::test]
async fn test_fatal_handler_result_stops_processor_without_commit() {
    let tester = tester(1);
    let processor =
        SimpleProcessor::new(tester.clone(), None, orders(Arc::new(FailOnValue("poison")))).unwrap();
    let (_processor, task) = spawn(processor);

    send(&tester, "k0", "fine").await;
    send(&tester, "k1", "poison").await;

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(ProcessorError::Partition(PartitionError::Fatal { .. }))
    ));
    assert_eq!(committed_offsets(&tester), vec![0]);
}

#[tokio::test]
async fn test_revoked_partition_stops_receiving_messages() {
    let tester = tester(2);
    let handler = Arc::new(RecordingHandler::default());
    let processor = SimpleProcessor::new(tester.clone(), None, orders(handler.clone())).unwrap();
    let (processor, task) = spawn(processor);

    send(&tester, "k0", "v").await;
    send(&tester, "k1", "v").await;
    assert!(wait_until(WAIT, || tester.commits().len() == 2).await);

    tester.revoke("orders", 1).await.unwrap();
    // Round-robin lands k2 on partition 0 and k3 on the revoked partition 1
    send(&tester, "k2", "v").await;
    send(&tester, "k3", "v").await;
    send(&tester, "k4", "v").await;
    assert!(wait_until(WAIT, || tester.commits().len() == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handled: Vec<String> = handler.seen().into_iter().map(|(_, _, k, _)| k).collect();
    assert_eq!(handled, vec!["k0", "k1", "k2", "k4"]);
    assert_eq!(tester.commits().len(), 4);

    processor.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_auxiliary_failure_does_not_stop_processing() {
    let tester = tester(1);
    let handler = Arc::new(RecordingHandler::default());
    let processor = SimpleProcessor::new(
        tester.clone(),
        Some(Arc::new(BrokenAuxiliary)),
        orders(handler.clone()),
    )
    .unwrap();
    let (processor, task) = spawn(processor);

    send(&tester, "k0", "v").await;
    assert!(wait_until(WAIT, || tester.commits().len() == 1).await);

    processor.close();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_consumer_disconnect_stops_processor() {
    let tester = tester(1);
    let processor = SimpleProcessor::new(
        tester.clone(),
        None,
        orders(Arc::new(RecordingHandler::default())),
    )
    .unwrap();
    let (_processor, task) = spawn(processor);

    send(&tester, "k0", "v").await;
    assert!(wait_until(WAIT, || tester.commits().len() == 1).await);
    tester.disconnect();

    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_processor_is_runnable() {
    let tester = tester(1);
    let processor: Arc<dyn Runnable> = Arc::new(
        SimpleProcessor::new(
            tester.clone(),
            None,
            orders(Arc::new(RecordingHandler::default())),
        )
        .unwrap(),
    );

    let running = processor.clone();
    let task = tokio::spawn(async move { running.run().await });
    send(&tester, "k0", "v").await;
    assert!(wait_until(WAIT, || tester.commits().len() == 1).await);

    processor.close().await;
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_can_stop_its_processor() {
    let tester = tester(1);
    let processor =
        SimpleProcessor::new(tester.clone(), None, orders(Arc::new(StopOnValue("stop")))).unwrap();
    let handle = processor.handle();
    let (_processor, task) = spawn(processor);

    send(&tester, "k0", "go on").await;
    send(&tester, "k1", "stop").await;

    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert!(handle.is_closed());
    assert_eq!(committed_offsets(&tester).first(), Some(&0));
}
