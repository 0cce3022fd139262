use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{KvError, KvStore, MemoryKvStore};

/// Test double for [`KvStore`].
///
/// Results can be programmed per key for `get`, `set`, `hget` and `hset`; anything not
/// programmed falls through to an in-memory store, so a mock can also act as a working
/// store. Every call is recorded.
#[derive(Clone, Default)]
pub struct MockKvStore {
    get_ret: HashMap<String, Result<String, KvError>>,
    set_ret: HashMap<String, Result<(), KvError>>,
    hget_ret: HashMap<String, Result<String, KvError>>,
    hset_ret: HashMap<String, Result<(), KvError>>,
    backing: Arc<MemoryKvStore>,
    calls: Arc<Mutex<Vec<MockKvCall>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockKvCall {
    pub op: String,
    pub key: String,
    pub field: Option<String>,
    pub value: Option<String>,
}

impl MockKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockKvCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &str, key: &str, field: Option<&str>, value: Option<&str>) {
        self.lock_calls().push(MockKvCall {
            op: op.to_string(),
            key: key.to_string(),
            field: field.map(str::to_string),
            value: value.map(str::to_string),
        });
    }

    pub fn get_ret(&mut self, key: &str, ret: Result<String, KvError>) -> Self {
        self.get_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn set_ret(&mut self, key: &str, ret: Result<(), KvError>) -> Self {
        self.set_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn hget_ret(&mut self, key: &str, ret: Result<String, KvError>) -> Self {
        self.hget_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn hset_ret(&mut self, key: &str, ret: Result<(), KvError>) -> Self {
        self.hset_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockKvCall> {
        self.lock_calls().clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<MockKvCall> {
        self.lock_calls()
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl KvStore for MockKvStore {
    async fn set(&self, key: &str, value: String) -> Result<(), KvError> {
        self.record("set", key, None, Some(value.as_str()));
        match self.set_ret.get(key) {
            Some(ret) => ret.clone(),
            None => self.backing.set(key, value).await,
        }
    }

    async fn get(&self, key: &str) -> Result<String, KvError> {
        self.record("get", key, None, None);
        match self.get_ret.get(key) {
            Some(ret) => ret.clone(),
            None => self.backing.get(key).await,
        }
    }

    async fn delete(&self, keys: &[&str]) -> Result<usize, KvError> {
        for key in keys {
            self.record("delete", key, None, None);
        }
        self.backing.delete(keys).await
    }

    async fn exists(&self, keys: &[&str]) -> Result<usize, KvError> {
        for key in keys {
            self.record("exists", key, None, None);
        }
        self.backing.exists(keys).await
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), KvError> {
        self.record("hset", key, Some(field), Some(value.as_str()));
        match self.hset_ret.get(key) {
            Some(ret) => ret.clone(),
            None => self.backing.hset(key, field, value).await,
        }
    }

    async fn hset_many(&self, key: &str, values: HashMap<String, String>) -> Result<(), KvError> {
        for (field, value) in &values {
            self.record("hset_many", key, Some(field.as_str()), Some(value.as_str()));
        }
        self.backing.hset_many(key, values).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<String, KvError> {
        self.record("hget", key, Some(field), None);
        match self.hget_ret.get(key) {
            Some(ret) => ret.clone(),
            None => self.backing.hget(key, field).await,
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        self.record("hget_all", key, None, None);
        self.backing.hget_all(key).await
    }

    async fn hdelete(&self, key: &str, fields: &[&str]) -> Result<usize, KvError> {
        for field in fields {
            self.record("hdelete", key, Some(*field), None);
        }
        self.backing.hdelete(key, fields).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        self.record("expire", key, None, None);
        self.backing.expire(key, ttl).await
    }
}
