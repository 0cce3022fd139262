use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::processor::RetryPolicy;

/// Smallest depth of the partition manager's error channel.
pub const MIN_PARTITION_ERRORS_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Commit on the partition's own task right after each message
    Inline,
    /// Queue commits for a dedicated drain task
    Async,
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inline" | "sync" => Ok(CommitMode::Inline),
            "async" | "buffered" => Ok(CommitMode::Async),
            other => Err(format!("unknown commit mode: {other}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "inline")]
    pub commit_mode: CommitMode,

    #[envconfig(default = "100")]
    pub commit_buffer_size: usize,

    #[envconfig(default = "10")]
    pub partition_errors_buffer: usize,

    #[envconfig(default = "stream_processor_")]
    pub offset_key_prefix: String,

    #[envconfig(default = "10")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(default = "5000")]
    pub retry_maximum_interval_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Inline,
            commit_buffer_size: 100,
            partition_errors_buffer: MIN_PARTITION_ERRORS_BUFFER,
            offset_key_prefix: "stream_processor_".to_string(),
            retry_initial_interval_ms: 10,
            retry_backoff_coefficient: 2,
            retry_maximum_interval_ms: 5000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn partition_errors_buffer(&self) -> usize {
        self.partition_errors_buffer.max(MIN_PARTITION_ERRORS_BUFFER)
    }

    pub fn commit_buffer_size(&self) -> usize {
        self.commit_buffer_size.max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_backoff_coefficient,
            Duration::from_millis(self.retry_initial_interval_ms),
            Some(Duration::from_millis(self.retry_maximum_interval_ms)),
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
