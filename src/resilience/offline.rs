//! Persisted offline mode.
//!
//! While active, discovery is disabled entirely and callers get an offline
//! resolution without any quota or provider traffic. The flag expires on its
//! own so a transient outage cannot switch discovery off for good.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{span, SharedClock};
use crate::store::{keys, load_json, save_json, SharedStore};
use crate::types::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineState {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub reason: String,
}

pub struct OfflineMode {
    store: SharedStore,
    clock: SharedClock,
    state: RwLock<Option<OfflineState>>,
}

impl OfflineMode {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            state: RwLock::new(None),
        }
    }

    /// Active offline state, clearing it once expired
    pub fn current(&self) -> Option<OfflineState> {
        let now = self.clock.now();
        let state = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match state {
            Some(s) if s.until > now => Some(s),
            Some(_) => {
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = None;
                info!("Offline mode expired");
                None
            }
            None => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    pub async fn enter(&self, reason: &str, duration: Duration) -> OfflineState {
        let now = self.clock.now();
        let state = OfflineState {
            since: now,
            until: now + span(duration),
            reason: reason.to_string(),
        };
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        warn!(reason = %reason, until = %state.until, "Entering offline mode");

        if let Err(e) = save_json(self.store.as_ref(), keys::OFFLINE, &state, Some(state.until)).await {
            warn!(error = %e, "Failed to persist offline mode");
        }
        state
    }

    pub async fn exit(&self) -> bool {
        let was_active = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();

        if let Err(e) = self.store.delete(keys::OFFLINE).await {
            warn!(error = %e, "Failed to clear persisted offline mode");
        }
        if was_active {
            info!("Offline mode cleared");
        }
        was_active
    }

    /// Reload a persisted, still-active offline state
    pub async fn restore(&self) -> Result<bool> {
        let saved: Option<OfflineState> = load_json(self.store.as_ref(), keys::OFFLINE).await?;
        let now = self.clock.now();
        match saved {
            Some(state) if state.until > now => {
                info!(until = %state.until, "Restored offline mode");
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_enter_expire_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let offline = OfflineMode::new(store.clone(), clock.clone());

        assert!(!offline.is_active());
        offline.enter("circuit open", Duration::from_secs(900)).await;
        assert!(offline.is_active());

        let revived = OfflineMode::new(store.clone(), clock.clone());
        assert!(revived.restore().await.unwrap());
        assert_eq!(revived.current().unwrap().reason, "circuit open");

        clock.advance(Duration::from_secs(901));
        assert!(!offline.is_active());
        assert!(!revived.is_active());
    }

    #[tokio::test]
    async fn test_exit_clears_store() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let offline = OfflineMode::new(store.clone(), clock);

        offline.enter("operator", Duration::from_secs(60)).await;
        assert!(offline.exit().await);
        assert!(!offline.is_active());
        assert!(store.is_empty());
        assert!(!offline.exit().await);
    }
}
