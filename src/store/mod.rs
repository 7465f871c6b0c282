//! Durable key-value store collaborator.
//!
//! Backs the cache's durable tier and persists quota windows, circuit
//! states, offline mode and feature flags across restarts. Every record can
//! carry an expiry; bulk deletion goes through [`StoreFilter`].

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Persisted key names
pub mod keys {
    pub const CACHE_PREFIX: &str = "cache:";
    pub const QUOTA_WINDOWS: &str = "quota:windows";
    pub const CIRCUITS: &str = "resilience:circuits";
    pub const OFFLINE: &str = "resilience:offline";
    pub const FLAGS: &str = "rollout:flags";
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A stored value plus optional expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn expiring(value: serde_json::Value, expires_at: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Selection for `delete_where`; all present criteria must match
#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    pub prefix: Option<String>,
    pub expired_before: Option<DateTime<Utc>>,
}

impl StoreFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            expired_before: None,
        }
    }

    pub fn expired_before(mut self, at: DateTime<Utc>) -> Self {
        self.expired_before = Some(at);
        self
    }

    pub fn matches(&self, key: &str, record: &StoredRecord) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(before) = self.expired_before {
            if !record.is_expired(before) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError>;

    async fn set(&self, key: &str, record: StoredRecord) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every record matching `filter`, returning how many were removed
    async fn delete_where(&self, filter: &StoreFilter) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn DurableStore>;

/// Read and decode a JSON value, ignoring expiry
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value with optional expiry
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let record = StoredRecord {
        value: serde_json::to_value(value)?,
        expires_at,
    };
    store.set(key, record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_prefix_and_expiry() {
        let now = Utc::now();
        let stale = StoredRecord::expiring(json!(1), now - chrono::Duration::seconds(5));
        let fresh = StoredRecord::expiring(json!(1), now + chrono::Duration::seconds(5));
        let forever = StoredRecord::new(json!(1));

        let filter = StoreFilter::prefix(keys::CACHE_PREFIX).expired_before(now);
        assert!(filter.matches("cache:acme", &stale));
        assert!(!filter.matches("cache:acme", &fresh));
        assert!(!filter.matches("cache:acme", &forever));
        assert!(!filter.matches("quota:windows", &stale));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        save_json(&store, "k", &vec![1, 2, 3], None).await.unwrap();
        let back: Option<Vec<u32>> = load_json(&store, "k").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<u32>> = load_json(&store, "nope").await.unwrap();
        assert!(missing.is_none());
    }
}
