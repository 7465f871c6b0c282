//! Resilience controller
//!
//! Wraps each provider call in a per-operation circuit breaker, a timeout and
//! a bounded retry loop, then hands persistent failures to the fallback chain.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::breaker::{Admission, BreakerConfig, BreakerState, CircuitBreakers, CircuitState};
use super::fallback::{default_strategies, ErrorContext, FallbackChain, FallbackConfig, FallbackOutcome};
use super::offline::OfflineMode;
use super::retry::Backoff;
use crate::cache::DiscoveryCache;
use crate::clock::SharedClock;
use crate::provider::ProviderError;
use crate::store::{keys, load_json, save_json, SharedStore};
use crate::telemetry::TelemetryRecorder;
use crate::types::{Candidate, GuardError, Result};

/// Operation key for company-name searches
pub const COMPANY_SEARCH: &str = "company-search";

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Retries after the first attempt (default: 2)
    pub max_retries: u32,
    /// Delay between attempts
    pub backoff: Backoff,
    /// Bound on every single call (default: 10 seconds)
    pub call_timeout: Duration,
    pub breaker: BreakerConfig,
    pub fallback: FallbackConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::default(),
            call_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Result of a guarded call
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// The call itself succeeded
    Fresh(Vec<Candidate>),
    /// A fallback strategy answered instead
    Fallback(FallbackOutcome),
}

pub struct ResilienceController {
    config: ResilienceConfig,
    store: SharedStore,
    clock: SharedClock,
    telemetry: Arc<TelemetryRecorder>,
    breakers: CircuitBreakers,
    chain: FallbackChain,
    offline: Arc<OfflineMode>,
}

impl ResilienceController {
    pub fn new(
        config: ResilienceConfig,
        store: SharedStore,
        clock: SharedClock,
        telemetry: Arc<TelemetryRecorder>,
        cache: Arc<DiscoveryCache>,
    ) -> Self {
        let offline = Arc::new(OfflineMode::new(store.clone(), clock.clone()));
        let chain = FallbackChain::new();
        for strategy in default_strategies(&config.fallback, cache, offline.clone(), clock.clone()) {
            chain.register(strategy);
        }

        info!(
            max_retries = config.max_retries,
            call_timeout_ms = config.call_timeout.as_millis() as u64,
            threshold = config.breaker.threshold,
            cooldown_secs = config.breaker.cooldown.as_secs(),
            fallbacks = ?chain.names(),
            "Resilience controller initialized"
        );

        Self {
            breakers: CircuitBreakers::new(config.breaker.clone(), clock.clone()),
            config,
            store,
            clock,
            telemetry,
            chain,
            offline,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn fallback_chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub fn offline(&self) -> &Arc<OfflineMode> {
        &self.offline
    }

    /// Run `op` under the breaker for `operation`, retrying transient
    /// failures, and fall back when the call cannot succeed.
    ///
    /// An open circuit skips the call entirely; the fallback chain otherwise
    /// sees the last provider error. `user_context` is passed to
    /// fallback handlers; the lookup name goes under `"name"`.
    pub async fn execute_with_recovery<F, Fut>(
        &self,
        operation: &str,
        user_context: BTreeMap<String, String>,
        op: F,
    ) -> Result<Recovery>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<Candidate>>> + Send,
    {
        let mut attempt: u32 = 0;

        let error = match self.breakers.admit(operation) {
            Admission::Rejected { retry_at } => {
                debug!(operation = %operation, retry_at = %retry_at, "Circuit open, skipping call");
                GuardError::CircuitOpen {
                    operation: operation.to_string(),
                    retry_at,
                }
            }
            Admission::Allowed => {
                let trial = self.breakers.state(operation) == BreakerState::HalfOpen;
                match self.attempt_with_retries(operation, trial, &mut attempt, &op).await {
                    Ok(candidates) => return Ok(Recovery::Fresh(candidates)),
                    Err(error) => error,
                }
            }
        };

        let context = ErrorContext {
            operation: operation.to_string(),
            attempt,
            error: error.to_string(),
            error_kind: error.kind(),
            timestamp: self.clock.now(),
            user_context,
        };

        match self.chain.run(&error, &context).await {
            Some(outcome) => Ok(Recovery::Fallback(outcome)),
            None => {
                warn!(operation = %operation, error = %error, "All fallback strategies failed");
                Err(GuardError::FallbackExhausted {
                    operation: operation.to_string(),
                    source: Box::new(error),
                })
            }
        }
    }

    /// Retry loop for an admitted call. The circuit is consulted only on
    /// entry: a circuit that trips mid-loop still lets the attempt budget run
    /// out, but a failed half-open trial stops at once.
    async fn attempt_with_retries<F, Fut>(
        &self,
        operation: &str,
        trial: bool,
        attempt: &mut u32,
        op: &F,
    ) -> Result<Vec<Candidate>>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<Candidate>>> + Send,
    {
        loop {
            *attempt += 1;
            // Wall-clock time, the same time base as the call timeout
            let started = Instant::now();
            let result = match tokio::time::timeout(self.config.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.config.call_timeout).into()),
            };
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let e = match result {
                Ok(candidates) => {
                    self.telemetry.record_request(true, latency_ms, operation);
                    if self.breakers.record_success(operation) {
                        self.persist_circuits().await;
                    }
                    return Ok(candidates);
                }
                Err(e) => e,
            };

            self.telemetry.record_request(false, latency_ms, operation);
            self.telemetry.record_error(&e, operation);

            if !e.is_transient() {
                self.breakers.release_trial(operation);
                return Err(e);
            }

            let before = self.breakers.state(operation);
            let after = self.breakers.record_failure(operation);
            if before != after {
                self.persist_circuits().await;
            }

            if trial || *attempt > self.config.max_retries {
                return Err(e);
            }

            let delay = self.config.backoff.delay_for_attempt(*attempt - 1);
            warn!(
                operation = %operation,
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Transient failure, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    pub async fn force_open(&self, operation: &str) {
        self.breakers.force_open(operation);
        self.persist_circuits().await;
    }

    pub async fn reset(&self, operation: &str) {
        self.breakers.reset(operation);
        self.persist_circuits().await;
    }

    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.breakers.snapshot(operation)
    }

    pub fn is_open(&self, operation: &str) -> bool {
        self.breakers.state(operation) == BreakerState::Open
    }

    /// Reload persisted circuits and offline mode
    pub async fn restore(&self) -> Result<usize> {
        let circuits: Option<Vec<CircuitState>> = load_json(self.store.as_ref(), keys::CIRCUITS).await?;
        let restored = circuits.map(|c| self.breakers.restore(c)).unwrap_or(0);
        self.offline.restore().await?;
        if restored > 0 {
            info!(restored, "Restored circuit states");
        }
        Ok(restored)
    }

    async fn persist_circuits(&self) {
        let circuits = self.breakers.all();
        if let Err(e) = save_json(self.store.as_ref(), keys::CIRCUITS, &circuits, None).await {
            warn!(error = %e, "Failed to persist circuit states");
        }
    }
}
