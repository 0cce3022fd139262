//! Generic key-value contract used to persist consumer offsets outside the broker.
//!
//! Values are strings, the way a redis-like backend stores them. Backends map their
//! native failures onto [`KvError`] so callers can decide what is fatal without
//! knowing which store they talk to.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
pub mod mock;

pub use memory::MemoryKvStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key does not exist")]
    KeyNotExists,
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("connection to the key-value store was dropped")]
    ConnectionDropped,
    #[error("key-value store error: {0}")]
    General(String),
    /// A backend failure that could not be mapped onto any of the other variants.
    #[error("unclassified key-value store error: {0}")]
    Unclassified(String),
}

impl KvError {
    /// Whether a caller that relies on the store for correctness must stop.
    ///
    /// Dropped connections and errors we cannot classify leave us unable to tell
    /// whether a write landed, so continuing would risk silently losing offsets.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KvError::ConnectionDropped | KvError::Unclassified(_))
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: String) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Returns how many of `keys` existed and were removed.
    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError>;

    /// Returns how many of `keys` currently exist.
    async fn exists(&self, keys: &[&str]) -> Result<usize, KvError>;

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), KvError>;

    async fn hset_many(&self, key: &str, values: HashMap<String, String>) -> Result<(), KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<String, KvError>;

    /// A missing key yields an empty map, not an error.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    async fn hdelete(&self, key: &str, fields: &[&str]) -> Result<usize, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
}
