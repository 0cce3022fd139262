//! Stream processor for partitioned topics.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use formats that
//! include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` for errors that wrap a source; they only show the top-level message.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics_consts;
pub mod partition;
pub mod partition_manager;
pub mod processor;
pub mod runnable;
pub mod tester;
pub mod test_utils;
pub mod ticker;

// Re-export commonly used types for convenience
pub use codec::{Codec, CodecError, DecodedKv, EncodedKv, JsonCodec, StringCodec};
pub use config::{CommitMode, Config};
pub use consumer::{Consumer, MessageEvent, PartitionEvent, StartOffset, TopicPartition};
pub use error::ProcessorError;
pub use processor::{
    HandlerResult, ProcessorContext, ProcessorHandle, SimpleProcessor, TopicDefinition,
    TopicHandler,
};
pub use runnable::{run_composite_in_process, run_in_process, CompositeRunnable, Runnable};
