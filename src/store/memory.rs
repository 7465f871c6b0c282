//! In-memory durable store.
//!
//! Used when no on-disk path is configured and by tests. `set_available`
//! simulates an outage so degraded paths can be exercised.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DurableStore, StoreError, StoreFilter, StoredRecord};

#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, StoredRecord>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.ensure_available()?;
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, record: StoredRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        Ok(self.records.remove(key).is_some())
    }

    async fn delete_where(&self, filter: &StoreFilter) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let before = self.records.len();
        self.records.retain(|key, record| !filter.matches(key, record));
        Ok(before.saturating_sub(self.records.len()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}
