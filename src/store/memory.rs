use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::CoordinationRecord;
use crate::store::traits::{CoordinationStore, StoreLock};

/// In-process coordination store.
///
/// Clones share state, so handing one clone to each task simulates several
/// workers inside a single test binary.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<String, CoordinationRecord>>>,
    /// Keys currently locked. Sync mutex so the guard can release on drop.
    held: Arc<Mutex<HashSet<String>>>,
}

struct MemoryLock {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl StoreLock for MemoryLock {}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    /// Keys that currently have a record, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_lock(&self, key: &str) -> Result<Option<Box<dyn StoreLock>>> {
        let mut held = self.held.lock();
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })))
    }

    async fn read_record(&self, key: &str) -> Result<Option<CoordinationRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn write_record(&self, key: &str, record: &CoordinationRecord) -> Result<()> {
        self.records.write().await.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn remove_record(&self, key: &str) -> Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let store = MemoryStore::new();
        let peer = store.clone();

        let guard = store.try_lock("signal_migrations_done").await.unwrap();
        assert!(guard.is_some());
        assert!(peer.is_locked("signal_migrations_done"));
        assert!(peer.try_lock("signal_migrations_done").await.unwrap().is_none());

        drop(guard);
        assert!(!peer.is_locked("signal_migrations_done"));
    }

    #[tokio::test]
    async fn test_records_shared_between_clones() {
        let store = MemoryStore::new();
        let peer = store.clone();

        store
            .write_record("test_branch", &CoordinationRecord::ready(json!("br-1"), "gw0"))
            .await
            .unwrap();
        let record = peer.read_record("test_branch").await.unwrap().unwrap();
        assert!(record.ready);

        assert_eq!(peer.keys().await, vec!["test_branch"]);

        peer.remove_record("test_branch").await.unwrap();
        assert!(store.read_record("test_branch").await.unwrap().is_none());
        assert!(store.keys().await.is_empty());
    }
}
