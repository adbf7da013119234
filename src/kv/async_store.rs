//! The async flavor of [`crate::kv::KeyValueStore`]/[`crate::kv::Transaction`]
//! (§4.G "async variants return futures"), gated behind the `async` feature
//! the same way the teacher crate gates its `async-io`/notify plumbing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::kv::TxMode;

/// An async-flavored scope over the backing store with commit/abort
/// semantics, mirroring [`crate::kv::Transaction`].
#[async_trait]
pub trait AsyncTransaction: std::fmt::Debug + Send {
    /// Fetch the value for `key`, or `None` if absent.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `value` at `key`. If `overwrite` is false and `key` already
    /// exists, returns `Ok(false)` without writing.
    async fn put(&mut self, key: &str, value: Vec<u8>, overwrite: bool) -> Result<bool>;
    /// Remove `key`, if present.
    async fn del(&mut self, key: &str) -> Result<()>;
    /// Commit the transaction.
    async fn commit(&mut self) -> Result<()>;
    /// Abort the transaction, rolling back any writes.
    async fn abort(&mut self) -> Result<()>;
}

/// A flat, async key-value store.
#[async_trait]
pub trait AsyncKeyValueStore: std::fmt::Debug + Send + Sync {
    /// A stable backend name.
    fn name(&self) -> &str;
    /// Remove every key.
    async fn clear(&self) -> Result<()>;
    /// Begin a new transaction.
    async fn begin_transaction(&self, mode: TxMode) -> Box<dyn AsyncTransaction>;
}

/// An in-memory async store, the async twin of
/// [`crate::kv::memory::InMemoryStore`]. Every operation is already
/// synchronous under the hood; this exists so the async engine and its
/// consumers (the mirror, `LockedFs`) have a real multi-step-await-capable
/// backend to drive, not merely a `SynchronousAsAsync` wrapper.
#[derive(Debug, Clone)]
pub struct InMemoryAsyncStore {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryAsyncStore {
    /// A fresh, empty store.
    pub fn new() -> Self {
        InMemoryAsyncStore {
            data: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryAsyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncKeyValueStore for InMemoryAsyncStore {
    fn name(&self) -> &str {
        "InMemoryAsyncStore"
    }

    async fn clear(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    async fn begin_transaction(&self, mode: TxMode) -> Box<dyn AsyncTransaction> {
        Box::new(SimpleAsyncRwTransaction {
            store: self.data.clone(),
            mode,
            original_data: HashMap::new(),
            modified_keys: HashSet::new(),
            finished: false,
        })
    }
}

/// The async twin of [`crate::kv::memory::SimpleRwTransaction`]: same
/// stash-and-restore rollback strategy, same no-op commit.
#[derive(Debug)]
struct SimpleAsyncRwTransaction {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    mode: TxMode,
    original_data: HashMap<String, Option<Vec<u8>>>,
    modified_keys: HashSet<String>,
    finished: bool,
}

impl SimpleAsyncRwTransaction {
    fn stash(&mut self, key: &str) {
        if !self.modified_keys.contains(key) {
            let pre_image = self.store.lock().get(key).cloned();
            self.original_data.insert(key.to_string(), pre_image);
            self.modified_keys.insert(key.to_string());
        }
    }

    fn restore(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut guard = self.store.lock();
        for key in &self.modified_keys {
            match self.original_data.get(key).unwrap() {
                Some(value) => {
                    guard.insert(key.clone(), value.clone());
                }
                None => {
                    guard.remove(key);
                }
            }
        }
    }
}

#[async_trait]
impl AsyncTransaction for SimpleAsyncRwTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(key).cloned())
    }

    async fn put(&mut self, key: &str, value: Vec<u8>, overwrite: bool) -> Result<bool> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::read_only("write on a read-only transaction"));
        }
        self.stash(key);
        let mut guard = self.store.lock();
        if !overwrite && guard.contains_key(key) {
            return Ok(false);
        }
        guard.insert(key.to_string(), value);
        Ok(true)
    }

    async fn del(&mut self, key: &str) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::read_only("delete on a read-only transaction"));
        }
        self.stash(key);
        self.store.lock().remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.restore();
        Ok(())
    }
}

impl Drop for SimpleAsyncRwTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_restores_pre_image() {
        let store = InMemoryAsyncStore::new();
        {
            let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
            tx.put("a", b"orig".to_vec(), true).await.unwrap();
            tx.commit().await.unwrap();
        }
        {
            let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
            tx.put("a", b"changed".to_vec(), true).await.unwrap();
            tx.abort().await.unwrap();
        }
        let mut tx = store.begin_transaction(TxMode::ReadOnly).await;
        assert_eq!(tx.get("a").await.unwrap(), Some(b"orig".to_vec()));
    }

    #[tokio::test]
    async fn put_without_overwrite_refuses_existing_key() {
        let store = InMemoryAsyncStore::new();
        let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
        assert!(tx.put("k", b"1".to_vec(), false).await.unwrap());
        assert!(!tx.put("k", b"2".to_vec(), false).await.unwrap());
    }
}
