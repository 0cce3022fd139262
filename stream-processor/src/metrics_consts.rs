// ==== Partition metrics ====
/// Counter for messages handed to a partition handler
pub const MESSAGES_HANDLED: &str = "stream_processor_messages_handled_total";

/// Counter for messages the codec could not decode (handler skipped, offset still committed)
pub const MESSAGES_DECODE_FAILED: &str = "stream_processor_messages_decode_failed_total";

/// Histogram for time spent in the handler, retries included
pub const HANDLER_DURATION: &str = "stream_processor_handler_duration_seconds";

/// Counter for handler results asking to retry the same message
pub const HANDLER_RETRIES: &str = "stream_processor_handler_retries_total";

// ==== Partition manager metrics ====
/// Counter for messages dropped because their partition is not live on this consumer
pub const MESSAGES_DROPPED_NOT_LIVE: &str = "stream_processor_messages_dropped_not_live_total";

/// Gauge for partitions currently owned by the manager
pub const LIVE_PARTITIONS: &str = "stream_processor_live_partitions";

// ==== Commit metrics ====
/// Counter for offsets handed to the commit strategy
pub const OFFSETS_COMMITTED: &str = "stream_processor_offsets_committed_total";

/// Counter for commit attempts that failed without being fatal
pub const OFFSET_COMMIT_FAILURES: &str = "stream_processor_offset_commit_failures_total";
