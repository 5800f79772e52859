//! In-process counter store.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::backend::CounterStore;
use super::window::SlidingWindow;
use crate::error::StoreError;

/// Window records held in process memory.
///
/// Each key's record sits behind its map shard lock for the whole
/// prune-check-append sequence, which makes operations atomic across tasks
/// of one process. Not shared between processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, VecDeque<u64>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently recorded for `key`, without pruning.
    pub fn entry_count(&self, key: &str) -> usize {
        self.records.get(key).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of keys with a non-empty record.
    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    /// Clear all records.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool, StoreError> {
        let window = SlidingWindow::new(window_ms, limit);
        let mut record = self.records.entry(key.to_string()).or_default();
        let admitted = window.admit(record.value_mut(), now_ms);
        let empty = record.is_empty();
        drop(record);

        if empty {
            self.records.remove_if(key, |_, r| r.is_empty());
        }

        trace!(key = %key, admitted, "Memory store admission");
        Ok(admitted)
    }

    async fn remaining(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<u64, StoreError> {
        let window = SlidingWindow::new(window_ms, limit);
        let Some(mut record) = self.records.get_mut(key) else {
            return Ok(limit);
        };
        let remaining = window.remaining(record.value_mut(), now_ms);
        let empty = record.is_empty();
        drop(record);

        if empty {
            self.records.remove_if(key, |_, r| r.is_empty());
        }
        Ok(remaining)
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_admit_records_entry() {
        let store = MemoryStore::new();

        assert!(store.admit("k", 0, 1000, 2).await.unwrap());
        assert_eq!(store.entry_count("k"), 1);
        assert_eq!(store.remaining("k", 0, 1000, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_empty_record() {
        let store = MemoryStore::new();

        assert_eq!(store.remaining("nobody", 0, 1000, 4).await.unwrap(), 4);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_fully_pruned_record_disappears() {
        let store = MemoryStore::new();

        store.admit("k", 0, 100, 5).await.unwrap();
        assert_eq!(store.key_count(), 1);

        assert_eq!(store.remaining("k", 500, 100, 5).await.unwrap(), 5);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = MemoryStore::new();

        assert!(store.admit("a", 0, 1000, 1).await.unwrap());
        assert!(!store.admit("a", 1, 1000, 1).await.unwrap());
        assert!(store.admit("b", 1, 1000, 1).await.unwrap());
        assert_eq!(store.remaining("a", 2, 1000, 1).await.unwrap(), 0);
        assert_eq!(store.remaining("b", 2, 1000, 1).await.unwrap(), 0);
        assert_eq!(store.remaining("c", 2, 1000, 1).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_overshoot() {
        let store = Arc::new(MemoryStore::new());
        let limit = 7;

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.admit("hot", 10, 1000, limit).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted as u64, limit);
        assert_eq!(store.entry_count("hot") as u64, limit);
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        tokio_test::block_on(store.admit("k", 0, 1000, 1)).unwrap();
        assert_eq!(store.key_count(), 1);

        store.clear();
        assert_eq!(store.key_count(), 0);
    }
}
