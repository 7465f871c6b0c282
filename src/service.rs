//! Discovery guard facade
//!
//! Wires the governance components together and exposes the lookup entry
//! point plus the status and administrative surface.
//!
//! One lookup flows: validate name, rollout gate, offline short-circuit,
//! cache, quota peek, then the scheduler (which owns the provider call).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, DiscoveryCache};
use crate::clock::SharedClock;
use crate::config::{GuardConfig, MAX_NAME_LENGTH};
use crate::housekeeping::{spawn_housekeeping_task, Housekeeper};
use crate::provider::SharedProvider;
use crate::quota::{QuotaGovernor, QuotaStatus};
use crate::resilience::{CircuitState, OfflineState, ResilienceController};
use crate::rollout::{Evaluation, IdentityContext, RolloutGate};
use crate::scheduler::{QueueStats, Scheduler};
use crate::store::SharedStore;
use crate::telemetry::{
    Alert, CacheRoundTripProbe, HealthReport, ProviderProbe, SchedulerProbe, StoreProbe,
    TelemetryMetrics, TelemetryRecorder,
};
use crate::types::{Candidate, Discovery, FallbackAction, GuardError, Priority, Result};

/// What `restore` reloaded from the durable store
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub quota_windows: usize,
    pub circuits: usize,
    pub flags: usize,
    pub offline: bool,
}

/// Combined status snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardStatus {
    pub quota: QuotaStatus,
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub metrics: TelemetryMetrics,
    pub health: HealthReport,
    pub alerts: Vec<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline: Option<OfflineState>,
}

pub struct DiscoveryGuard {
    config: GuardConfig,
    cache: Arc<DiscoveryCache>,
    quota: Arc<QuotaGovernor>,
    telemetry: Arc<TelemetryRecorder>,
    resilience: Arc<ResilienceController>,
    rollout: Arc<RolloutGate>,
    scheduler: Arc<Scheduler>,
    housekeeper: Arc<Housekeeper>,
    housekeeping_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryGuard {
    pub fn new(
        config: GuardConfig,
        provider: SharedProvider,
        store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(DiscoveryCache::new(config.cache.clone(), store.clone(), clock.clone()));
        let quota = Arc::new(QuotaGovernor::new(config.quota.clone(), store.clone(), clock.clone()));
        let telemetry = Arc::new(TelemetryRecorder::new(config.telemetry.clone(), clock.clone()));
        let resilience = Arc::new(ResilienceController::new(
            config.resilience.clone(),
            store.clone(),
            clock.clone(),
            telemetry.clone(),
            cache.clone(),
        ));
        let rollout = Arc::new(RolloutGate::new(config.rollout_config(), store.clone(), clock.clone()));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            clock.clone(),
            cache.clone(),
            quota.clone(),
            resilience.clone(),
            provider.clone(),
        ));
        let housekeeper = Arc::new(Housekeeper::new(
            config.housekeeping.clone(),
            clock,
            cache.clone(),
            quota.clone(),
            rollout.clone(),
        ));

        telemetry.register_probe(Arc::new(StoreProbe(store)));
        telemetry.register_probe(Arc::new(ProviderProbe(provider.clone())));
        telemetry.register_probe(Arc::new(CacheRoundTripProbe(cache.clone())));
        telemetry.register_probe(Arc::new(SchedulerProbe(Arc::downgrade(&scheduler))));

        info!(
            provider = provider.id(),
            flag = %config.discovery_flag,
            "Discovery guard initialized"
        );

        Ok(Self {
            config,
            cache,
            quota,
            telemetry,
            resilience,
            rollout,
            scheduler,
            housekeeper,
            housekeeping_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Reload quota windows, circuits, offline mode and flags
    pub async fn restore(&self) -> Result<RestoreReport> {
        let quota_windows = self.quota.restore().await?;
        let circuits = self.resilience.restore().await?;
        let flags = self.rollout.restore().await?;
        let report = RestoreReport {
            quota_windows,
            circuits,
            flags,
            offline: self.resilience.offline().is_active(),
        };
        info!(
            quota_windows,
            circuits,
            flags,
            offline = report.offline,
            "Restored persisted state"
        );
        Ok(report)
    }

    /// Start the scheduler worker and background housekeeping
    pub fn start(&self) {
        self.scheduler.start();

        let mut task = self
            .housekeeping_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            let tick = self.housekeeper.config().tick;
            *task = Some(spawn_housekeeping_task(self.housekeeper.clone(), tick));
        }
    }

    pub async fn shutdown(&self) {
        let task = self
            .housekeeping_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.scheduler.shutdown().await;
        info!("Discovery guard stopped");
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Discover company pages for `name` on behalf of the service itself
    pub async fn discover(&self, name: &str, priority: Priority) -> Result<Discovery> {
        self.discover_as(&IdentityContext::system(), name, priority).await
    }

    /// Discover company pages for `name` on behalf of `identity`
    pub async fn discover_as(
        &self,
        identity: &IdentityContext,
        name: &str,
        priority: Priority,
    ) -> Result<Discovery> {
        let name = validate_name(name)?;

        let evaluation = self.rollout.is_enabled(&self.config.discovery_flag, identity);
        if !evaluation.enabled {
            debug!(name = %name, reason = %evaluation.reason, "Discovery disabled by rollout");
            return Err(GuardError::FeatureDisabled {
                flag: self.config.discovery_flag.clone(),
                reason: evaluation.reason.to_string(),
            });
        }

        if let Some(state) = self.resilience.offline().current() {
            debug!(name = %name, until = %state.until, "Offline mode, skipping discovery");
            return Ok(Discovery::from_fallback(name, FallbackAction::OfflineMode, Vec::new()));
        }

        let cached = self.cache.get(name).await;
        self.telemetry.record_cache_hit(cached.is_some());
        if let Some(candidates) = cached {
            return Ok(Discovery::from_cache(name, candidates));
        }

        if let Err(e) = self.quota.check().into_result() {
            self.telemetry.record_error(&e, "quota");
            return Err(e);
        }

        self.scheduler
            .enqueue(name, priority, self.config.scheduler.max_retries)
            .await
    }

    /// Discover every name; failures map to an empty result
    pub async fn discover_batch(&self, names: &[String]) -> HashMap<String, Vec<Candidate>> {
        let results = join_all(names.iter().map(|name| async move {
            let candidates = match self.discover(name, Priority::Normal).await {
                Ok(discovery) => discovery.candidates,
                Err(e) => {
                    debug!(name = %name, error = %e, "Batch lookup failed");
                    Vec::new()
                }
            };
            (name.clone(), candidates)
        }))
        .await;

        results.into_iter().collect()
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn quota_status(&self) -> QuotaStatus {
        self.quota.status()
    }

    pub async fn health_status(&self) -> HealthReport {
        self.telemetry.perform_health_check().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.stats()
    }

    pub fn metrics(&self) -> TelemetryMetrics {
        self.telemetry.metrics()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.telemetry.check_alerts()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_enabled(&self, flag: &str, identity: &IdentityContext) -> Evaluation {
        self.rollout.is_enabled(flag, identity)
    }

    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.resilience.circuit_state(operation)
    }

    pub async fn status(&self) -> GuardStatus {
        GuardStatus {
            quota: self.quota_status(),
            queue: self.queue_stats(),
            cache: self.cache_stats(),
            metrics: self.metrics(),
            health: self.health_status().await,
            alerts: self.alerts(),
            offline: self.resilience.offline().current(),
        }
    }

    // ========================================================================
    // Administration
    // ========================================================================

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    /// Cancel every pending lookup
    pub fn clear(&self) -> usize {
        self.scheduler.clear()
    }

    pub async fn force_open_circuit(&self, operation: &str) {
        warn!(operation = %operation, "Circuit forced open");
        self.resilience.force_open(operation).await;
    }

    pub async fn reset_circuit(&self, operation: &str) {
        info!(operation = %operation, "Circuit reset");
        self.resilience.reset(operation).await;
    }

    pub async fn exit_offline_mode(&self) -> bool {
        self.resilience.offline().exit().await
    }

    // Component access for embedding applications and tests

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    pub fn quota(&self) -> &Arc<QuotaGovernor> {
        &self.quota
    }

    pub fn rollout(&self) -> &Arc<RolloutGate> {
        &self.rollout
    }

    pub fn resilience(&self) -> &Arc<ResilienceController> {
        &self.resilience
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<TelemetryRecorder> {
        &self.telemetry
    }

    pub fn housekeeper(&self) -> &Arc<Housekeeper> {
        &self.housekeeper
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GuardError::Validation("company name must not be empty".into()));
    }
    let length = trimmed.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(GuardError::Validation(format!(
            "company name is {length} characters, limit is {MAX_NAME_LENGTH}"
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::ScriptedProvider;
    use crate::store::MemoryStore;
    use crate::telemetry::HealthStatus;
    use std::time::Duration;

    fn guard() -> (DiscoveryGuard, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::returning(vec![Candidate::new(
            "https://example.com/company/acme",
            "Acme",
            "acme",
            0.9,
        )]));
        let mut config = GuardConfig::default();
        config.scheduler.pacing = Duration::ZERO;
        let guard = DiscoveryGuard::new(
            config,
            provider.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::starting_now()),
        )
        .unwrap();
        (guard, provider)
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  Acme  ").unwrap(), "Acme");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = GuardConfig::default();
        config.discovery_flag = String::new();
        let result = DiscoveryGuard::new(
            config,
            Arc::new(ScriptedProvider::returning(Vec::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::starting_now()),
        );
        assert!(matches!(result, Err(GuardError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_name_never_reaches_provider() {
        let (guard, provider) = guard();
        guard.start();
        assert!(matches!(
            guard.discover("", Priority::High).await,
            Err(GuardError::Validation(_))
        ));
        assert_eq!(provider.call_count(), 0);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reports_stopped_scheduler() {
        let (guard, _) = guard();
        let report = guard.health_status().await;
        assert_eq!(report.probes.len(), 4);
        assert_eq!(report.status, HealthStatus::Degraded);

        guard.start();
        assert_eq!(guard.health_status().await.status, HealthStatus::Healthy);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_on_empty_store() {
        let (guard, _) = guard();
        let report = guard.restore().await.unwrap();
        assert_eq!(report.circuits, 0);
        assert_eq!(report.flags, 0);
        assert!(!report.offline);
    }
}
