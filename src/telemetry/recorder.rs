//! Rolling outcome history and derived rates

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::health::{HealthProbe, HealthReport, HealthStatus, ProbeResult};
use crate::clock::SharedClock;
use crate::types::{ErrorKind, GuardError};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Latencies kept for the average (default: 100)
    pub latency_history: usize,
    /// Errors kept for inspection (default: 50)
    pub error_history: usize,
    /// Outcomes kept for the error rate (default: 100)
    pub outcome_history: usize,
    /// Cache lookups needed before the hit-rate alert can fire (default: 20)
    pub min_cache_samples: u64,
    /// Per-probe timeout during health checks (default: 5 seconds)
    pub probe_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            latency_history: 100,
            error_history: 50,
            outcome_history: 100,
            min_cache_samples: 20,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// One completed call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: f64,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failures over the rolling outcome window
    pub error_rate: f64,
    /// Mean over the rolling latency window
    pub average_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

const ERROR_RATE_CRITICAL: f64 = 0.10;
const ERROR_RATE_WARNING: f64 = 0.05;
const CACHE_HIT_RATE_WARNING: f64 = 0.50;
const LATENCY_CRITICAL_MS: f64 = 5000.0;
const LATENCY_WARNING_MS: f64 = 3000.0;

#[derive(Default)]
struct History {
    latencies: VecDeque<f64>,
    outcomes: VecDeque<OutcomeRecord>,
    errors: VecDeque<ErrorRecord>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap.max(1) {
        queue.pop_front();
    }
}

pub struct TelemetryRecorder {
    config: TelemetryConfig,
    clock: SharedClock,
    history: RwLock<History>,
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
}

impl TelemetryRecorder {
    pub fn new(config: TelemetryConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            history: RwLock::new(History::default()),
            probes: RwLock::new(Vec::new()),
        }
    }

    pub fn record_request(&self, success: bool, latency_ms: f64, endpoint: &str) {
        let record = OutcomeRecord {
            timestamp: self.clock.now(),
            success,
            latency_ms,
            endpoint: endpoint.to_string(),
        };
        if let Ok(mut h) = self.history.write() {
            h.total_requests += 1;
            if success {
                h.successful_requests += 1;
            } else {
                h.failed_requests += 1;
            }
            push_bounded(&mut h.latencies, latency_ms, self.config.latency_history);
            push_bounded(&mut h.outcomes, record, self.config.outcome_history);
        }
    }

    pub fn record_cache_hit(&self, hit: bool) {
        if let Ok(mut h) = self.history.write() {
            if hit {
                h.cache_hits += 1;
            } else {
                h.cache_misses += 1;
            }
        }
    }

    pub fn record_error(&self, error: &GuardError, context: &str) {
        let record = ErrorRecord {
            timestamp: self.clock.now(),
            kind: error.kind(),
            message: error.to_string(),
            context: context.to_string(),
        };
        debug!(kind = record.kind.as_str(), context = %context, "Recorded error");
        if let Ok(mut h) = self.history.write() {
            push_bounded(&mut h.errors, record, self.config.error_history);
        }
    }

    pub fn metrics(&self) -> TelemetryMetrics {
        let h = self.history.read().unwrap_or_else(PoisonError::into_inner);

        let error_rate = if h.outcomes.is_empty() {
            0.0
        } else {
            h.outcomes.iter().filter(|o| !o.success).count() as f64 / h.outcomes.len() as f64
        };
        let average_latency_ms = if h.latencies.is_empty() {
            0.0
        } else {
            h.latencies.iter().sum::<f64>() / h.latencies.len() as f64
        };
        let cache_total = h.cache_hits + h.cache_misses;
        let cache_hit_rate = if cache_total == 0 {
            0.0
        } else {
            h.cache_hits as f64 / cache_total as f64
        };

        TelemetryMetrics {
            total_requests: h.total_requests,
            successful_requests: h.successful_requests,
            failed_requests: h.failed_requests,
            error_rate,
            average_latency_ms,
            cache_hits: h.cache_hits,
            cache_misses: h.cache_misses,
            cache_hit_rate,
            recent_errors: h.errors.iter().cloned().collect(),
        }
    }

    pub fn check_alerts(&self) -> Vec<Alert> {
        let m = self.metrics();
        let has_outcomes = m.total_requests > 0;
        let mut alerts = Vec::new();

        if has_outcomes && m.error_rate > ERROR_RATE_CRITICAL {
            alerts.push(alert(AlertLevel::Critical, "error_rate", "Error rate critical", m.error_rate, ERROR_RATE_CRITICAL));
        } else if has_outcomes && m.error_rate > ERROR_RATE_WARNING {
            alerts.push(alert(AlertLevel::Warning, "error_rate", "Error rate elevated", m.error_rate, ERROR_RATE_WARNING));
        }

        if m.cache_hits + m.cache_misses >= self.config.min_cache_samples
            && m.cache_hit_rate < CACHE_HIT_RATE_WARNING
        {
            alerts.push(alert(
                AlertLevel::Warning,
                "cache_hit_rate",
                "Cache hit rate low",
                m.cache_hit_rate,
                CACHE_HIT_RATE_WARNING,
            ));
        }

        if has_outcomes && m.average_latency_ms > LATENCY_CRITICAL_MS {
            alerts.push(alert(AlertLevel::Critical, "average_latency_ms", "Latency critical", m.average_latency_ms, LATENCY_CRITICAL_MS));
        } else if has_outcomes && m.average_latency_ms > LATENCY_WARNING_MS {
            alerts.push(alert(AlertLevel::Warning, "average_latency_ms", "Latency elevated", m.average_latency_ms, LATENCY_WARNING_MS));
        }

        for a in &alerts {
            warn!(metric = %a.metric, value = a.value, threshold = a.threshold, level = ?a.level, "{}", a.message);
        }
        alerts
    }

    pub fn register_probe(&self, probe: Arc<dyn HealthProbe>) {
        if let Ok(mut probes) = self.probes.write() {
            probes.retain(|p| p.name() != probe.name());
            probes.push(probe);
        }
    }

    /// Run every registered probe under its own timeout and aggregate
    pub async fn perform_health_check(&self) -> HealthReport {
        let probes: Vec<Arc<dyn HealthProbe>> = self
            .probes
            .read()
            .map(|p| p.clone())
            .unwrap_or_default();
        let timeout = self.config.probe_timeout;

        let results: Vec<ProbeResult> = join_all(probes.iter().map(|probe| async move {
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(timeout, probe.check()).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(format!("timed out after {:?}", timeout)),
            };
            ProbeResult {
                name: probe.name().to_string(),
                healthy: error.is_none(),
                latency_ms,
                error,
            }
        }))
        .await;

        let passed = results.iter().filter(|r| r.healthy).count();
        let status = HealthStatus::aggregate(passed, results.len());
        if status != HealthStatus::Healthy {
            warn!(passed, total = results.len(), status = status.as_str(), "Health check degraded");
        }

        HealthReport {
            status,
            probes: results,
            checked_at: self.clock.now(),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut h) = self.history.write() {
            *h = History::default();
        }
    }
}

fn alert(level: AlertLevel, metric: &str, message: &str, value: f64, threshold: f64) -> Alert {
    Alert {
        level,
        metric: metric.to_string(),
        message: message.to_string(),
        value,
        threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::ProviderError;
    use async_trait::async_trait;

    fn recorder() -> TelemetryRecorder {
        TelemetryRecorder::new(TelemetryConfig::default(), Arc::new(ManualClock::starting_now()))
    }

    #[test]
    fn test_rates_and_averages() {
        let t = recorder();
        for _ in 0..9 {
            t.record_request(true, 100.0, "company-search");
        }
        t.record_request(false, 1100.0, "company-search");

        let m = t.metrics();
        assert_eq!(m.total_requests, 10);
        assert_eq!(m.failed_requests, 1);
        assert!((m.error_rate - 0.1).abs() < 1e-9);
        assert!((m.average_latency_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let t = TelemetryRecorder::new(
            TelemetryConfig {
                latency_history: 3,
                error_history: 2,
                ..Default::default()
            },
            Arc::new(ManualClock::starting_now()),
        );
        for i in 0..5 {
            t.record_request(true, i as f64, "x");
            t.record_error(&GuardError::Cancelled, "x");
        }
        let m = t.metrics();
        assert!((m.average_latency_ms - 3.0).abs() < 1e-9);
        assert_eq!(m.recent_errors.len(), 2);
        assert_eq!(m.total_requests, 5);
    }

    #[test]
    fn test_error_rate_alert_levels() {
        let t = recorder();
        for _ in 0..94 {
            t.record_request(true, 10.0, "x");
        }
        for _ in 0..6 {
            t.record_request(false, 10.0, "x");
        }
        let alerts = t.check_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);

        for _ in 0..6 {
            t.record_request(false, 10.0, "x");
        }
        let alerts = t.check_alerts();
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].metric, "error_rate");
    }

    #[test]
    fn test_cache_alert_needs_samples() {
        let t = recorder();
        for _ in 0..10 {
            t.record_cache_hit(false);
        }
        assert!(t.check_alerts().is_empty());

        for _ in 0..10 {
            t.record_cache_hit(false);
        }
        let alerts = t.check_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "cache_hit_rate");
        assert_eq!(t.metrics().cache_hit_rate, 0.0);
    }

    #[test]
    fn test_latency_alerts() {
        let t = recorder();
        t.record_request(true, 4000.0, "x");
        assert_eq!(t.check_alerts()[0].level, AlertLevel::Warning);
        t.record_request(true, 8000.0, "x");
        assert_eq!(t.check_alerts()[0].level, AlertLevel::Critical);

        t.reset();
        assert!(t.check_alerts().is_empty());
    }

    struct Fixed(&'static str, bool);

    #[async_trait]
    impl HealthProbe for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(&self) -> Result<(), String> {
            if self.1 {
                Ok(())
            } else {
                Err("down".into())
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl HealthProbe for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_health_aggregation() {
        let t = recorder();
        assert_eq!(t.perform_health_check().await.status, HealthStatus::Healthy);

        t.register_probe(Arc::new(Fixed("store", true)));
        t.register_probe(Arc::new(Fixed("provider", true)));
        t.register_probe(Arc::new(Fixed("cache", true)));
        t.register_probe(Arc::new(Fixed("scheduler", true)));
        assert_eq!(t.perform_health_check().await.status, HealthStatus::Healthy);

        t.register_probe(Arc::new(Fixed("provider", false)));
        t.register_probe(Arc::new(Fixed("cache", false)));
        let report = t.perform_health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.probes.len(), 4);

        t.register_probe(Arc::new(Fixed("store", false)));
        assert_eq!(t.perform_health_check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out_without_blocking_others() {
        let t = TelemetryRecorder::new(
            TelemetryConfig {
                probe_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(ManualClock::starting_now()),
        );
        t.register_probe(Arc::new(Fixed("store", true)));
        t.register_probe(Arc::new(Hanging));

        let report = t.perform_health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        let hanging = report.probes.iter().find(|p| p.name == "hanging").unwrap();
        assert!(hanging.error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn test_error_records_kind() {
        let t = recorder();
        t.record_error(&ProviderError::Network("reset".into()).into(), "company-search");
        let m = t.metrics();
        assert_eq!(m.recent_errors[0].kind, ErrorKind::ProviderUnavailable);
        assert_eq!(m.recent_errors[0].context, "company-search");
    }
}
