//! Cache key normalization

use crate::store::keys::CACHE_PREFIX;

/// Canonical form of a lookup name: trimmed and lowercased
pub fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Durable-store key for a normalized name
pub fn durable_key(normalized: &str) -> String {
    format!("{}{}", CACHE_PREFIX, normalized)
}
