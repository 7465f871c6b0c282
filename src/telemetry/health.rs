//! Health probes and aggregation

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::DiscoveryCache;
use crate::provider::SharedProvider;
use crate::scheduler::Scheduler;
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// All pass: healthy. At least half: degraded. Otherwise unhealthy.
    pub fn aggregate(passed: usize, total: usize) -> Self {
        if passed == total {
            Self::Healthy
        } else if passed * 2 >= total {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub probes: Vec<ProbeResult>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// Durable store reachability
pub struct StoreProbe(pub SharedStore);

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

/// Provider reachability
pub struct ProviderProbe(pub SharedProvider);

#[async_trait]
impl HealthProbe for ProviderProbe {
    fn name(&self) -> &str {
        "provider"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

/// Cache encode, durable write, read back, delete
pub struct CacheRoundTripProbe(pub Arc<DiscoveryCache>);

#[async_trait]
impl HealthProbe for CacheRoundTripProbe {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.round_trip().await
    }
}

/// Scheduler worker is alive
pub struct SchedulerProbe(pub Weak<Scheduler>);

#[async_trait]
impl HealthProbe for SchedulerProbe {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> Result<(), String> {
        let scheduler = self.0.upgrade().ok_or("scheduler dropped")?;
        if scheduler.is_running() {
            Ok(())
        } else {
            Err("scheduler worker not running".into())
        }
    }
}
