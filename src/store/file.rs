//! Single-document JSON file store.
//!
//! The whole keyspace lives in memory and is flushed to disk after every
//! mutation (write to `<path>.tmp`, then rename). A mutation whose flush
//! fails is rolled back, so memory never runs ahead of the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{DurableStore, StoreError, StoreFilter, StoredRecord};

pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing contents if the file exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), records = records.len(), "Opened JSON file store");

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &HashMap<String, StoredRecord>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), records = records.len(), "Flushed store");
        Ok(())
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, record: StoredRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let previous = records.insert(key.to_string(), record);
        if let Err(e) = self.flush(&records).await {
            match previous {
                Some(previous) => records.insert(key.to_string(), previous),
                None => records.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn delete_where(&self, filter: &StoreFilter) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let doomed: Vec<String> = records
            .iter()
            .filter(|(key, record)| filter.matches(key, record))
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed: Vec<(String, StoredRecord)> = doomed
            .into_iter()
            .filter_map(|key| records.remove(&key).map(|record| (key, record)))
            .collect();
        if let Err(e) = self.flush(&records).await {
            records.extend(removed);
            return Err(e);
        }
        Ok(removed.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::metadata(parent).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.set("quota:windows", StoredRecord::new(json!({"n": 3}))).await.unwrap();
            store.set("cache:acme", StoredRecord::new(json!([1]))).await.unwrap();
            assert!(store.delete("cache:acme").await.unwrap());
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let record = reopened.get("quota:windows").await.unwrap().unwrap();
        assert_eq!(record.value, json!({"n": 3}));
        assert!(reopened.get("cache:acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("absent.json")).await.unwrap();
        assert!(store.get("anything").await.unwrap().is_none());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_flush_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.set("quota:windows", StoredRecord::new(json!({"n": 1}))).await.unwrap();

        // A directory squatting on the temp path makes every flush fail
        let blocker = dir.path().join("guard.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert!(store.set("quota:windows", StoredRecord::new(json!({"n": 2}))).await.is_err());
        assert!(store.set("cache:acme", StoredRecord::new(json!([1]))).await.is_err());
        assert!(store.delete("quota:windows").await.is_err());
        assert!(store.delete_where(&StoreFilter::prefix("quota:")).await.is_err());

        let kept = store.get("quota:windows").await.unwrap().unwrap();
        assert_eq!(kept.value, json!({"n": 1}));
        assert!(store.get("cache:acme").await.unwrap().is_none());

        std::fs::remove_dir(&blocker).unwrap();
        store.set("cache:acme", StoredRecord::new(json!([1]))).await.unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("quota:windows").await.unwrap().unwrap().value, json!({"n": 1}));
        assert!(reopened.get("cache:acme").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_where_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        let now = Utc::now();

        let store = JsonFileStore::open(&path).await.unwrap();
        store
            .set("cache:old", StoredRecord::expiring(json!(1), now - chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .set("cache:new", StoredRecord::expiring(json!(1), now + chrono::Duration::hours(1)))
            .await
            .unwrap();

        let removed = store
            .delete_where(&StoreFilter::prefix("cache:").expired_before(now))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert!(reopened.get("cache:old").await.unwrap().is_none());
        assert!(reopened.get("cache:new").await.unwrap().is_some());
    }
}
