use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use kv_store::MemoryKvStore;
use stream_processor::tester::{ConsumerTester, TopicDescription};
use stream_processor::ticker::Ticker;
use stream_processor::{
    run_in_process, CommitMode, Config, DecodedKv, HandlerResult, ProcessorContext, Runnable,
    SimpleProcessor, StringCodec, TopicDefinition, TopicHandler,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_TOPIC: &str = "demo";
const DEMO_PARTITIONS: i32 = 3;

struct LoggingHandler;

#[async_trait]
impl TopicHandler<StringCodec> for LoggingHandler {
    async fn handle(&self, ctx: &ProcessorContext, message: &DecodedKv<String, String>) -> HandlerResult {
        info!(
            partition = %ctx.topic_partition(),
            offset = ctx.offset(),
            key = %message.key,
            value = %message.value,
            "Handled message"
        );
        HandlerResult::Continue
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("Failed to load configuration from environment")?;
    info!(?config, "Starting stream processor demo");

    let codec = Arc::new(StringCodec);
    let consumer = Arc::new(ConsumerTester::new(vec![TopicDescription::new(
        DEMO_TOPIC,
        DEMO_PARTITIONS,
        codec.clone(),
    )]));

    let producer = consumer.clone();
    let sequence = Arc::new(AtomicU64::new(0));
    let ticker: Arc<dyn Runnable> = Arc::new(Ticker::new(Duration::from_secs(1), move || {
        let producer = producer.clone();
        let key = format!("key-{}", sequence.fetch_add(1, Ordering::Relaxed));
        tokio::spawn(async move {
            if let Err(e) = producer
                .send_message(DEMO_TOPIC, &key, &"hello".to_string())
                .await
            {
                tracing::warn!(error = ?e, "Failed to send demo message");
            }
        });
    }));

    let commit_mode = config.commit_mode;
    let commit_buffer = config.commit_buffer_size();
    let mut processor = SimpleProcessor::with_config(
        consumer,
        Some(ticker),
        vec![TopicDefinition::new(DEMO_TOPIC, codec, Arc::new(LoggingHandler))],
        config,
    )
    .context("Failed to create processor")?;

    // Offsets live in memory for the lifetime of the demo
    let offsets = Arc::new(MemoryKvStore::new());
    let janitor_shutdown = CancellationToken::new();
    let janitor = {
        let offsets = offsets.clone();
        let shutdown = janitor_shutdown.clone();
        tokio::spawn(async move { offsets.run_janitor(Duration::from_secs(60), shutdown).await })
    };
    match commit_mode {
        CommitMode::Inline => processor.set_kv_store_behavior(offsets),
        CommitMode::Async => processor.set_async_kv_store_behavior(offsets, commit_buffer),
    }

    let result = run_in_process(Arc::new(processor)).await;
    janitor_shutdown.cancel();
    if let Err(e) = janitor.await {
        tracing::warn!(error = ?e, "Offset store janitor panicked");
    }
    result
}
