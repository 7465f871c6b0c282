//! Configuration for the discovery guard
//!
//! `GuardConfig` aggregates every component's config. `Args` exposes the same
//! knobs on the command line with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::CacheConfig;
use crate::housekeeping::HousekeepingConfig;
use crate::provider::HttpProviderConfig;
use crate::quota::{QuotaConfig, WindowKind, WindowLimit};
use crate::resilience::fallback::{CACHED_RESULT, HEURISTIC, MANUAL_INPUT, OFFLINE_MODE, SKIP_DISCOVERY};
use crate::resilience::{Backoff, BreakerConfig, FallbackConfig, ResilienceConfig};
use crate::rollout::{RolloutConfig, COMPANY_DISCOVERY};
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;
use crate::types::{GuardError, Priority, Result};

/// Longest accepted lookup name, in characters
pub const MAX_NAME_LENGTH: usize = 200;

const KNOWN_FALLBACKS: [&str; 5] = [CACHED_RESULT, MANUAL_INPUT, SKIP_DISCOVERY, OFFLINE_MODE, HEURISTIC];

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub scheduler: SchedulerConfig,
    pub resilience: ResilienceConfig,
    pub rollout: RolloutConfig,
    pub telemetry: TelemetryConfig,
    pub housekeeping: HousekeepingConfig,
    /// Flag that gates `discover` (default: company-discovery)
    pub discovery_flag: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            quota: QuotaConfig::default(),
            scheduler: SchedulerConfig::default(),
            resilience: ResilienceConfig::default(),
            rollout: RolloutConfig::default(),
            telemetry: TelemetryConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            discovery_flag: COMPANY_DISCOVERY.to_string(),
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = |what: &str| Err(GuardError::Config(format!("{what} must be greater than zero")));

        if self.cache.memory_ttl.is_zero() {
            return zero("cache memory TTL");
        }
        if self.cache.durable_ttl.is_zero() {
            return zero("cache durable TTL");
        }
        if self.cache.memory_capacity == 0 {
            return zero("cache memory capacity");
        }

        for kind in WindowKind::ALL {
            let limit = self.quota.limit(kind);
            if limit.limit == 0 {
                return zero(&format!("{} quota limit", kind.as_str()));
            }
            if limit.duration.is_zero() {
                return zero(&format!("{} quota window", kind.as_str()));
            }
        }

        if self.scheduler.max_queue_size == 0 {
            return zero("scheduler queue size");
        }
        if self.resilience.call_timeout.is_zero() {
            return zero("call timeout");
        }
        if self.resilience.breaker.threshold == 0 {
            return zero("circuit breaker threshold");
        }
        if self.resilience.breaker.half_open_successes == 0 {
            return zero("half-open success count");
        }
        if self.rollout.evaluation_ttl.is_zero() {
            return zero("rollout evaluation TTL");
        }

        if self.rollout.default_rollout_percentage > 100 {
            return Err(GuardError::Config(format!(
                "default rollout percentage {} exceeds 100",
                self.rollout.default_rollout_percentage
            )));
        }
        if let Some((key, pct)) = self.rollout.default_flags.iter().find(|(_, pct)| **pct > 100) {
            return Err(GuardError::Config(format!("rollout percentage {pct} for flag {key} exceeds 100")));
        }
        if self.discovery_flag.trim().is_empty() {
            return Err(GuardError::Config("discovery flag name must not be empty".into()));
        }
        if let Some(unknown) = self
            .resilience
            .fallback
            .enabled
            .iter()
            .find(|name| !KNOWN_FALLBACKS.contains(&name.as_str()))
        {
            return Err(GuardError::Config(format!("unknown fallback strategy: {unknown}")));
        }

        Ok(())
    }

    /// Rollout config with the discovery flag guaranteed to be seeded
    pub fn rollout_config(&self) -> RolloutConfig {
        let mut rollout = self.rollout.clone();
        rollout
            .default_flags
            .entry(self.discovery_flag.clone())
            .or_insert(rollout.default_rollout_percentage);
        rollout
    }
}

/// Discovery Guard - resilient company-page lookups
#[derive(Parser, Debug, Clone)]
#[command(name = "discovery-guard")]
#[command(about = "Quota-governed, cached, circuit-broken company-page discovery")]
pub struct Args {
    /// Company names to discover
    pub names: Vec<String>,

    /// Search endpoint of the provider
    #[arg(long, env = "DISCOVERY_PROVIDER_URL", default_value = "http://localhost:8080/search")]
    pub provider_url: String,

    /// Bearer token for the provider (never logged)
    #[arg(long, env = "DISCOVERY_PROVIDER_API_KEY", hide_env_values = true)]
    pub provider_api_key: Option<String>,

    /// Client-side HTTP timeout in milliseconds
    #[arg(long, env = "DISCOVERY_PROVIDER_TIMEOUT_MS", default_value = "10000")]
    pub provider_timeout_ms: u64,

    /// JSON file persisting cache, quota, circuit and flag state.
    /// In-memory only when unset.
    #[arg(long, env = "DISCOVERY_STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Priority for the lookups (high, normal, low)
    #[arg(long, env = "DISCOVERY_PRIORITY", default_value = "normal")]
    pub priority: Priority,

    /// Print quota, queue, health and alert status as JSON
    #[arg(long)]
    pub status: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    // Cache
    /// Memory-tier TTL in seconds
    #[arg(long, env = "CACHE_MEMORY_TTL_SECS", default_value = "3600")]
    pub cache_memory_ttl_secs: u64,

    /// Memory-tier capacity
    #[arg(long, env = "CACHE_MEMORY_CAPACITY", default_value = "500")]
    pub cache_memory_capacity: usize,

    /// Durable-tier TTL in seconds
    #[arg(long, env = "CACHE_DURABLE_TTL_SECS", default_value = "604800")]
    pub cache_durable_ttl_secs: u64,

    // Quota
    /// Calls per burst window
    #[arg(long, env = "QUOTA_BURST_LIMIT", default_value = "5")]
    pub quota_burst_limit: u32,

    /// Burst window length in seconds
    #[arg(long, env = "QUOTA_BURST_SECS", default_value = "10")]
    pub quota_burst_secs: u64,

    /// Calls per minute
    #[arg(long, env = "QUOTA_MINUTE_LIMIT", default_value = "20")]
    pub quota_minute_limit: u32,

    /// Calls per day
    #[arg(long, env = "QUOTA_DAY_LIMIT", default_value = "500")]
    pub quota_day_limit: u32,

    /// Calls per 30-day month
    #[arg(long, env = "QUOTA_MONTH_LIMIT", default_value = "10000")]
    pub quota_month_limit: u32,

    // Retries and pacing
    /// Retries per lookup, both in-call and re-queued
    #[arg(long, env = "MAX_RETRIES", default_value = "2")]
    pub max_retries: u32,

    /// Backoff base delay in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "1000")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "30000")]
    pub backoff_max_ms: u64,

    /// Backoff jitter in milliseconds
    #[arg(long, env = "BACKOFF_JITTER_MS", default_value = "250")]
    pub backoff_jitter_ms: u64,

    /// Base pause between provider calls in milliseconds
    #[arg(long, env = "PACING_MS", default_value = "250")]
    pub pacing_ms: u64,

    /// Pending lookups before normal/low submissions are refused
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value = "100")]
    pub max_queue_size: usize,

    // Circuit breaker
    /// Consecutive failures that open the circuit
    #[arg(long, env = "BREAKER_THRESHOLD", default_value = "5")]
    pub breaker_threshold: u32,

    /// Seconds an open circuit waits before a trial call
    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value = "60")]
    pub breaker_cooldown_secs: u64,

    /// Trial successes needed to close a half-open circuit
    #[arg(long, env = "BREAKER_HALF_OPEN_SUCCESSES", default_value = "2")]
    pub breaker_half_open_successes: u32,

    /// Bound on every provider call in milliseconds
    #[arg(long, env = "CALL_TIMEOUT_MS", default_value = "10000")]
    pub call_timeout_ms: u64,

    // Fallbacks
    /// Enabled fallback strategies, comma separated
    #[arg(
        long,
        env = "FALLBACKS",
        value_delimiter = ',',
        default_value = "cached-result,manual-input,skip-discovery,offline-mode,heuristic"
    )]
    pub fallbacks: Vec<String>,

    /// Max age in seconds of a cached result served on failure
    #[arg(long, env = "FALLBACK_FRESH_WINDOW_SECS", default_value = "1800")]
    pub fallback_fresh_window_secs: u64,

    /// Seconds offline mode lasts once entered
    #[arg(long, env = "OFFLINE_DURATION_SECS", default_value = "900")]
    pub offline_duration_secs: u64,

    /// Base URL for heuristic guesses
    #[arg(long, env = "HEURISTIC_BASE_URL", default_value = "https://www.linkedin.com/company")]
    pub heuristic_base_url: String,

    // Rollout
    /// Flag gating discovery
    #[arg(long, env = "DISCOVERY_FLAG", default_value = COMPANY_DISCOVERY)]
    pub discovery_flag: String,

    /// Rollout percentage seeded for the discovery flag
    #[arg(long, env = "DISCOVERY_ROLLOUT_PERCENTAGE", default_value = "100")]
    pub rollout_percentage: u8,

    /// Seconds a flag evaluation is reused
    #[arg(long, env = "ROLLOUT_EVALUATION_TTL_SECS", default_value = "60")]
    pub rollout_evaluation_ttl_secs: u64,
}

impl Args {
    pub fn to_config(&self) -> GuardConfig {
        let defaults = GuardConfig::default();
        let backoff = Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            Duration::from_millis(self.backoff_jitter_ms),
        );

        let mut rollout = RolloutConfig {
            evaluation_ttl: Duration::from_secs(self.rollout_evaluation_ttl_secs),
            default_rollout_percentage: self.rollout_percentage,
            default_flags: Default::default(),
        };
        rollout
            .default_flags
            .insert(self.discovery_flag.clone(), self.rollout_percentage);

        GuardConfig {
            cache: CacheConfig {
                memory_ttl: Duration::from_secs(self.cache_memory_ttl_secs),
                memory_capacity: self.cache_memory_capacity,
                durable_ttl: Duration::from_secs(self.cache_durable_ttl_secs),
            },
            quota: QuotaConfig {
                burst: WindowLimit::new(self.quota_burst_limit, Duration::from_secs(self.quota_burst_secs)),
                minute: WindowLimit::new(self.quota_minute_limit, defaults.quota.minute.duration),
                day: WindowLimit::new(self.quota_day_limit, defaults.quota.day.duration),
                month: WindowLimit::new(self.quota_month_limit, defaults.quota.month.duration),
            },
            scheduler: SchedulerConfig {
                max_retries: self.max_retries,
                backoff,
                pacing: Duration::from_millis(self.pacing_ms),
                max_queue_size: self.max_queue_size,
            },
            resilience: ResilienceConfig {
                max_retries: self.max_retries,
                backoff,
                call_timeout: Duration::from_millis(self.call_timeout_ms),
                breaker: BreakerConfig {
                    threshold: self.breaker_threshold,
                    cooldown: Duration::from_secs(self.breaker_cooldown_secs),
                    half_open_successes: self.breaker_half_open_successes,
                },
                fallback: FallbackConfig {
                    fresh_window: Duration::from_secs(self.fallback_fresh_window_secs),
                    offline_duration: Duration::from_secs(self.offline_duration_secs),
                    heuristic_base_url: self.heuristic_base_url.clone(),
                    enabled: self
                        .fallbacks
                        .iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                },
            },
            rollout,
            telemetry: defaults.telemetry,
            housekeeping: defaults.housekeeping,
            discovery_flag: self.discovery_flag.clone(),
        }
    }

    pub fn to_provider_config(&self) -> HttpProviderConfig {
        HttpProviderConfig {
            base_url: self.provider_url.clone(),
            api_key: self.provider_api_key.clone(),
            request_timeout: Duration::from_millis(self.provider_timeout_ms),
        }
    }
}
