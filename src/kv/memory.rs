//! The in-memory key-value backend (§4.H): a sync store whose RW
//! transaction rolls back via pre-image stashing rather than a real
//! write-ahead log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, Transaction, TxMode};

/// A flat in-memory key-value store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    /// A fresh, empty store.
    pub fn new() -> Self {
        InMemoryStore {
            data: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryStore {
    fn name(&self) -> &str {
        "InMemoryStore"
    }

    fn clear(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    fn begin_transaction(&self, mode: TxMode) -> Box<dyn Transaction + '_> {
        Box::new(SimpleRwTransaction {
            store: self.data.clone(),
            mode,
            original_data: HashMap::new(),
            modified_keys: HashSet::new(),
            finished: false,
        })
    }
}

/// The simple rollback-capable RW transaction described in §4.G/§8 (law
/// 10): on first touch of a key, stash its pre-image; `abort` restores or
/// deletes every touched key from that stash; `commit` is a no-op because
/// writes are already visible in the backing map (the Open Question this
/// crate keeps visible rather than "fixing" with an added write-ahead log).
#[derive(Debug)]
struct SimpleRwTransaction {
    store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    mode: TxMode,
    original_data: HashMap<String, Option<Vec<u8>>>,
    modified_keys: HashSet<String>,
    finished: bool,
}

impl SimpleRwTransaction {
    fn stash(&mut self, key: &str) {
        if !self.modified_keys.contains(key) {
            let pre_image = self.store.lock().get(key).cloned();
            self.original_data.insert(key.to_string(), pre_image);
            self.modified_keys.insert(key.to_string());
        }
    }
}

impl Transaction for SimpleRwTransaction {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Vec<u8>, overwrite: bool) -> Result<bool> {
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

    fn del(&mut self, key: &str) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(Error::read_only("delete on a read-only transaction"));
        }
        self.stash(key);
        self.store.lock().remove(key);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
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
        Ok(())
    }
}

impl Drop for SimpleRwTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_restores_pre_image_byte_for_byte() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin_transaction(TxMode::ReadWrite);
            tx.put("a", b"original".to_vec(), true).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut tx = store.begin_transaction(TxMode::ReadWrite);
            tx.put("a", b"changed".to_vec(), true).unwrap();
            tx.del("a").unwrap(); // still touches "a", stash already has pre-image
            tx.abort().unwrap();
        }
        let mut tx = store.begin_transaction(TxMode::ReadOnly);
        assert_eq!(tx.get("a").unwrap(), Some(b"original".to_vec()));
    }

    #[test]
    fn abort_deletes_keys_that_did_not_exist_before() {
        let store = InMemoryStore::new();
        let mut tx = store.begin_transaction(TxMode::ReadWrite);
        tx.put("new-key", b"x".to_vec(), true).unwrap();
        tx.abort().unwrap();
        let mut tx2 = store.begin_transaction(TxMode::ReadOnly);
        assert_eq!(tx2.get("new-key").unwrap(), None);
    }

    #[test]
    fn put_without_overwrite_refuses_existing_key() {
        let store = InMemoryStore::new();
        let mut tx = store.begin_transaction(TxMode::ReadWrite);
        assert!(tx.put("k", b"1".to_vec(), false).unwrap());
        assert!(!tx.put("k", b"2".to_vec(), false).unwrap());
        tx.commit().unwrap();
        let mut tx2 = store.begin_transaction(TxMode::ReadOnly);
        assert_eq!(tx2.get("k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin_transaction(TxMode::ReadOnly);
        assert!(tx.put("k", b"1".to_vec(), true).is_err());
    }
}
