use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{KvError, KvStore};

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local [`KvStore`] with redis-like typing and expiry.
///
/// Expired keys are invisible to every operation as soon as their deadline passes;
/// [`MemoryKvStore::purge_expired`] reclaims their memory.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means another caller panicked mid-operation; the map itself
    // is never left half-written by any method below.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries.get(key).filter(|e| e.is_live(Instant::now()))
    }

    /// Drops every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Periodically purges expired keys until `shutdown` is cancelled.
    pub async fn run_janitor(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired keys from memory store");
                    }
                }
            }
        }
    }

    /// Fetch a live hash for writing, creating it when absent.
    fn hash_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, String>, KvError> {
        let now = Instant::now();
        let replace = entries.get(key).map_or(true, |e| !e.is_live(now));
        if replace {
            entries.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }

        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(map)) => Ok(map),
            Some(Value::String(_)) => Err(KvError::WrongType),
            None => Err(KvError::General(format!("hash {key} vanished during write"))),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: String) -> Result<(), KvError> {
        let mut entries = self.write();
        if let Some(Value::Hash(_)) = Self::live(&entries, key).map(|e| &e.value) {
            return Err(KvError::WrongType);
        }
        entries.insert(key.to_string(), Entry::new(Value::String(value)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, KvError> {
        let entries = self.read();
        match Self::live(&entries, key).map(|e| &e.value) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Hash(_)) => Err(KvError::WrongType),
            None => Err(KvError::KeyNotExists),
        }
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = self.write();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(*key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, keys: &[&str]) -> Result<usize, KvError> {
        let entries = self.read();
        Ok(keys
            .iter()
            .filter(|k| Self::live(&entries, k).is_some())
            .count())
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), KvError> {
        let mut entries = self.write();
        Self::hash_mut(&mut entries, key)?.insert(field.to_string(), value);
        Ok(())
    }

    async fn hset_many(&self, key: &str, values: HashMap<String, String>) -> Result<(), KvError> {
        let mut entries = self.write();
        Self::hash_mut(&mut entries, key)?.extend(values);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<String, KvError> {
        let entries = self.read();
        match Self::live(&entries, key).map(|e| &e.value) {
            Some(Value::Hash(map)) => map.get(field).cloned().ok_or(KvError::KeyNotExists),
            Some(Value::String(_)) => Err(KvError::WrongType),
            None => Err(KvError::KeyNotExists),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let entries = self.read();
        match Self::live(&entries, key).map(|e| &e.value) {
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(Value::String(_)) => Err(KvError::WrongType),
            None => Ok(HashMap::new()),
        }
    }

    async fn hdelete(&self, key: &str, fields: &[&str]) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(0);
        };
        let Value::Hash(map) = &mut entry.value else {
            return Err(KvError::WrongType);
        };

        let removed = fields.iter().filter(|f| map.remove(**f).is_some()).count();
        if map.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let now = Instant::now();
        let mut entries = self.write();
        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(())
            }
            None => Err(KvError::KeyNotExists),
        }
    }
}
