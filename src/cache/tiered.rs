//! Two-tier discovery cache
//!
//! - **Memory tier**: short TTL (default 1 hour), bounded capacity, oldest
//!   entry evicted on overflow
//! - **Durable tier**: long TTL (default 7 days) in the [`DurableStore`], no
//!   capacity bound, purged by `cleanup`
//!
//! Store failures never reach the caller. A failed durable read is a miss, a
//! failed durable write leaves the memory tier serving the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::keys::{durable_key, normalize_key};
use crate::clock::{span, SharedClock};
use crate::store::{keys::CACHE_PREFIX, SharedStore, StoreFilter, StoredRecord};
use crate::types::Candidate;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory tier TTL (default: 1 hour)
    pub memory_ttl: Duration,
    /// Memory tier capacity in entries (default: 500)
    pub memory_capacity: usize,
    /// Durable tier TTL (default: 7 days)
    pub durable_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::from_secs(60 * 60),
            memory_capacity: 500,
            durable_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

// ============================================================================
// Entries and stats
// ============================================================================

/// A stored lookup result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub normalized_key: String,
    pub candidates: Vec<Candidate>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Age of the entry at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.cached_at
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.durable_hits
    }

    /// Exact hit rate over every `get`
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Durable key used by [`DiscoveryCache::round_trip`]
pub const HEALTH_KEY: &str = "health:cache";

pub struct DiscoveryCache {
    config: CacheConfig,
    store: SharedStore,
    clock: SharedClock,
    memory: DashMap<String, CacheEntry>,
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    store_errors: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(config: CacheConfig, store: SharedStore, clock: SharedClock) -> Self {
        info!(
            memory_ttl_secs = config.memory_ttl.as_secs(),
            memory_capacity = config.memory_capacity,
            durable_ttl_secs = config.durable_ttl.as_secs(),
            "Discovery cache initialized"
        );

        Self {
            config,
            store,
            clock,
            memory: DashMap::new(),
            memory_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up candidates for `name`, counting the hit or miss.
    ///
    /// Memory first, then durable; a durable hit backfills the memory tier.
    pub async fn get(&self, name: &str) -> Option<Vec<Candidate>> {
        let key = normalize_key(name);
        let now = self.clock.now();

        if let Some(candidates) = self.memory_hit(&key, now) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, tier = "memory", "Cache hit");
            return Some(candidates);
        }

        match self.durable_entry(&key, now).await {
            Some(mut entry) => {
                entry.hit_count += 1;
                let candidates = entry.candidates.clone();
                self.insert_memory(entry, now);
                self.durable_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, tier = "durable", "Cache hit, backfilled memory tier");
                Some(candidates)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Return the live entry for `name` without touching hit accounting
    pub async fn lookup(&self, name: &str) -> Option<CacheEntry> {
        let key = normalize_key(name);
        let now = self.clock.now();

        if let Some(entry) = self.memory.get(&key) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        }
        self.durable_entry(&key, now).await
    }

    /// Write `candidates` to both tiers
    pub async fn set(&self, name: &str, candidates: Vec<Candidate>) {
        let key = normalize_key(name);
        let now = self.clock.now();
        let entry = CacheEntry {
            normalized_key: key.clone(),
            candidates,
            cached_at: now,
            expires_at: now + positive_span(self.config.durable_ttl),
            hit_count: 0,
        };

        match serde_json::to_value(&entry) {
            Ok(value) => {
                let record = StoredRecord::expiring(value, entry.expires_at);
                if let Err(e) = self.store.set(&durable_key(&key), record).await {
                    self.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Durable cache write failed, memory tier only");
                }
            }
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Failed to encode cache entry");
            }
        }

        self.insert_memory(entry, now);
        debug!(key = %key, "Cached discovery result");
    }

    /// Remove `name` from both tiers
    pub async fn invalidate(&self, name: &str) -> bool {
        let key = normalize_key(name);
        let in_memory = self.memory.remove(&key).is_some();

        let in_store = match self.store.delete(&durable_key(&key)).await {
            Ok(removed) => removed,
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Durable cache invalidation failed");
                false
            }
        };

        in_memory || in_store
    }

    /// Drop expired memory-tier entries
    pub fn sweep_memory(&self) -> usize {
        let now = self.clock.now();
        let before = self.memory.len();
        self.memory.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.memory.len());
        if removed > 0 {
            debug!(removed, "Swept expired memory cache entries");
        }
        removed
    }

    /// Delete durable entries whose expiry has passed
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let filter = StoreFilter::prefix(CACHE_PREFIX).expired_before(now);

        match self.store.delete_where(&filter).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Durable cache cleanup");
                }
                removed
            }
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Durable cache cleanup failed");
                0
            }
        }
    }

    /// Write, read back and delete a marker entry in the durable tier.
    ///
    /// The marker lives outside the cache keyspace and never enters the
    /// memory tier, so the check neither evicts entries nor moves the stats.
    pub async fn round_trip(&self) -> Result<(), String> {
        let now = self.clock.now();
        let marker = CacheEntry {
            normalized_key: HEALTH_KEY.to_string(),
            candidates: vec![Candidate::new("health://cache", "health", "health", 1.0)],
            cached_at: now,
            expires_at: now + chrono::Duration::minutes(1),
            hit_count: 0,
        };
        let value = serde_json::to_value(&marker).map_err(|e| e.to_string())?;
        self.store
            .set(HEALTH_KEY, StoredRecord::expiring(value, marker.expires_at))
            .await
            .map_err(|e| e.to_string())?;

        let read = self.store.get(HEALTH_KEY).await.map_err(|e| e.to_string());
        if let Err(e) = self.store.delete(HEALTH_KEY).await {
            warn!(error = %e, "Failed to remove cache health marker");
        }

        let record = read?.ok_or("durable tier lost the health marker")?;
        match serde_json::from_value::<CacheEntry>(record.value) {
            Ok(entry) if entry == marker => Ok(()),
            Ok(_) => Err("durable tier returned a different value".into()),
            Err(e) => Err(format!("health marker did not decode: {e}")),
        }
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn memory_hit(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<Candidate>> {
        {
            let mut entry = self.memory.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.hit_count += 1;
                return Some(entry.candidates.clone());
            }
        }
        self.memory.remove(key);
        None
    }

    async fn durable_entry(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let record = match self.store.get(&durable_key(key)).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Durable cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_value::<CacheEntry>(record.value) {
            Ok(entry) if !entry.is_expired(now) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt durable cache entry");
                None
            }
        }
    }

    /// Insert into the memory tier, capping expiry at the memory TTL and
    /// never past the durable expiry
    fn insert_memory(&self, mut entry: CacheEntry, now: DateTime<Utc>) {
        let memory_expiry = now + positive_span(self.config.memory_ttl);
        entry.expires_at = entry.expires_at.min(memory_expiry);
        if entry.is_expired(now) {
            return;
        }

        if !self.memory.contains_key(&entry.normalized_key) {
            self.evict_until_fits();
        }
        self.memory.insert(entry.normalized_key.clone(), entry);
    }

    fn evict_until_fits(&self) {
        let capacity = self.config.memory_capacity.max(1);
        while self.memory.len() >= capacity {
            let oldest = self
                .memory
                .iter()
                .min_by_key(|e| e.value().cached_at)
                .map(|e| e.key().clone());

            match oldest {
                Some(key) => {
                    self.memory.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Evicted oldest memory cache entry");
                }
                None => break,
            }
        }
    }
}

/// TTL as a chrono span, floored at one millisecond so expiry stays after cachedAt
fn positive_span(ttl: Duration) -> chrono::Duration {
    span(ttl.max(Duration::from_millis(1)))
}
