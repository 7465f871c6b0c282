//! Discovery result cache
//!
//! Results are keyed by the normalized company name; see [`normalize_key`].

mod keys;
mod tiered;

pub use keys::{durable_key, normalize_key};
pub use tiered::{CacheConfig, CacheEntry, CacheStats, DiscoveryCache, HEALTH_KEY};
