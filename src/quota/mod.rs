//! Multi-window quota governor
//!
//! Four independent windows (burst, minute, day, month) gate outbound
//! provider calls. Every operation first rolls over windows whose reset time
//! has passed, via the pure [`rolled_over`] function. Check and increment
//! happen in one synchronous critical section; persistence follows outside
//! the lock and is best-effort, so an unreachable store never loosens the
//! ceilings held in memory.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{span, until, SharedClock};
use crate::store::{keys, load_json, save_json, SharedStore};
use crate::types::{GuardError, Result};

// ============================================================================
// Windows
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Burst,
    Minute,
    Day,
    Month,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [Self::Burst, Self::Minute, Self::Day, Self::Month];

    /// Evaluation order: the longest window decides first
    pub const STRICTNESS_ORDER: [WindowKind; 4] = [Self::Month, Self::Day, Self::Minute, Self::Burst];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::Minute => "minute",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Burst => 0,
            Self::Minute => 1,
            Self::Day => 2,
            Self::Month => 3,
        }
    }
}

/// Ceiling for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u32,
    pub duration: Duration,
}

impl WindowLimit {
    pub const fn new(limit: u32, duration: Duration) -> Self {
        Self { limit, duration }
    }
}

/// Counter state for one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub kind: WindowKind,
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// The window as it stands at `now`: unchanged before `reset_at`, fresh at or after it
pub fn rolled_over(window: &QuotaWindow, limit: &WindowLimit, now: DateTime<Utc>) -> QuotaWindow {
    if now >= window.reset_at {
        QuotaWindow {
            kind: window.kind,
            count: 0,
            reset_at: now + span(limit.duration),
        }
    } else {
        window.clone()
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Default: 5 per 10 seconds
    pub burst: WindowLimit,
    /// Default: 20 per minute
    pub minute: WindowLimit,
    /// Default: 500 per day
    pub day: WindowLimit,
    /// Default: 10 000 per 30 days
    pub month: WindowLimit,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            burst: WindowLimit::new(5, Duration::from_secs(10)),
            minute: WindowLimit::new(20, Duration::from_secs(60)),
            day: WindowLimit::new(500, Duration::from_secs(24 * 60 * 60)),
            month: WindowLimit::new(10_000, Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

impl QuotaConfig {
    pub fn limit(&self, kind: WindowKind) -> &WindowLimit {
        match kind {
            WindowKind::Burst => &self.burst,
            WindowKind::Minute => &self.minute,
            WindowKind::Day => &self.day,
            WindowKind::Month => &self.month,
        }
    }
}

// ============================================================================
// Decisions and status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub remaining: BTreeMap<WindowKind, u32>,
}

impl QuotaDecision {
    /// Convert a denial into `RateLimitExceeded`
    pub fn into_result(self) -> Result<QuotaDecision> {
        match (self.allowed, self.window) {
            (false, Some(window)) => Err(GuardError::RateLimitExceeded {
                window,
                retry_after_seconds: self.retry_after_seconds.unwrap_or(1),
            }),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatus {
    pub kind: WindowKind,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub windows: Vec<WindowStatus>,
    pub usage_ratio: f64,
}

// ============================================================================
// Governor
// ============================================================================

pub struct QuotaGovernor {
    config: QuotaConfig,
    store: SharedStore,
    clock: SharedClock,
    windows: Mutex<[QuotaWindow; 4]>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl QuotaGovernor {
    pub fn new(config: QuotaConfig, store: SharedStore, clock: SharedClock) -> Self {
        let now = clock.now();
        // reset_at = now so the first operation rolls every window over
        let windows = WindowKind::ALL.map(|kind| QuotaWindow {
            kind,
            count: 0,
            reset_at: now,
        });

        info!(
            burst = config.burst.limit,
            minute = config.minute.limit,
            day = config.day.limit,
            month = config.month.limit,
            "Quota governor initialized"
        );

        Self {
            config,
            store,
            clock,
            windows: Mutex::new(windows),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Evaluate admission without consuming quota
    pub fn check(&self) -> QuotaDecision {
        let now = self.clock.now();
        let mut windows = self.lock_windows();
        self.roll(&mut windows, now);
        self.evaluate(&windows, now)
    }

    /// Admit one provider call, incrementing every window on success
    pub async fn check_and_consume(&self) -> QuotaDecision {
        let decision = {
            let now = self.clock.now();
            let mut windows = self.lock_windows();
            self.roll(&mut windows, now);
            let decision = self.evaluate(&windows, now);
            if decision.allowed {
                for window in windows.iter_mut() {
                    window.count = window.count.saturating_add(1);
                }
                QuotaDecision {
                    remaining: self.remaining(&windows),
                    ..decision
                }
            } else {
                decision
            }
        };

        if decision.allowed {
            self.persist().await;
        } else {
            debug!(
                window = decision.window.map(|w| w.as_str()).unwrap_or("unknown"),
                retry_after = decision.retry_after_seconds.unwrap_or(0),
                "Quota denied"
            );
        }
        decision
    }

    pub fn status(&self) -> QuotaStatus {
        let now = self.clock.now();
        let mut windows = self.lock_windows();
        self.roll(&mut windows, now);

        let statuses = windows
            .iter()
            .map(|w| {
                let limit = self.config.limit(w.kind).limit;
                WindowStatus {
                    kind: w.kind,
                    used: w.count,
                    limit,
                    remaining: limit.saturating_sub(w.count),
                    reset_at: w.reset_at,
                }
            })
            .collect();

        QuotaStatus {
            windows: statuses,
            usage_ratio: self.ratio(&windows),
        }
    }

    /// Highest used/limit ratio across windows, 0.0 to 1.0
    pub fn usage_ratio(&self) -> f64 {
        let now = self.clock.now();
        let mut windows = self.lock_windows();
        self.roll(&mut windows, now);
        self.ratio(&windows)
    }

    /// Roll over every due window, returning how many were reset
    pub fn roll_over_all(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.lock_windows();
        self.roll(&mut windows, now)
    }

    /// Zero every counter and restart every window
    pub async fn reset(&self) {
        {
            let now = self.clock.now();
            let mut windows = self.lock_windows();
            for window in windows.iter_mut() {
                *window = QuotaWindow {
                    kind: window.kind,
                    count: 0,
                    reset_at: now + span(self.config.limit(window.kind).duration),
                };
            }
        }
        info!("Quota windows reset");
        self.persist().await;
    }

    /// Load persisted windows; windows that have since reset roll over on next use
    pub async fn restore(&self) -> Result<usize> {
        let saved: Option<Vec<QuotaWindow>> = load_json(self.store.as_ref(), keys::QUOTA_WINDOWS).await?;
        let Some(saved) = saved else {
            return Ok(0);
        };

        let now = self.clock.now();
        let mut windows = self.lock_windows();
        let mut restored = 0;
        for window in saved {
            let limit = self.config.limit(window.kind);
            // A window cannot legitimately reset further out than its own duration
            let max_reset = now + span(limit.duration);
            windows[window.kind.index()] = QuotaWindow {
                kind: window.kind,
                count: window.count,
                reset_at: window.reset_at.min(max_reset),
            };
            restored += 1;
        }
        self.roll(&mut windows, now);
        info!(restored, "Restored quota windows");
        Ok(restored)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock_windows(&self) -> MutexGuard<'_, [QuotaWindow; 4]> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn roll(&self, windows: &mut [QuotaWindow; 4], now: DateTime<Utc>) -> usize {
        let mut rolled = 0;
        for window in windows.iter_mut() {
            let fresh = rolled_over(window, self.config.limit(window.kind), now);
            if fresh != *window {
                *window = fresh;
                rolled += 1;
            }
        }
        rolled
    }

    fn evaluate(&self, windows: &[QuotaWindow; 4], now: DateTime<Utc>) -> QuotaDecision {
        for kind in WindowKind::STRICTNESS_ORDER {
            let window = &windows[kind.index()];
            let limit = self.config.limit(kind).limit;
            if window.count >= limit {
                let wait = until(now, window.reset_at);
                let retry_after = wait.as_millis().div_ceil(1000).max(1) as u64;
                return QuotaDecision {
                    allowed: false,
                    reason: Some(format!("{} quota exhausted ({}/{})", kind.as_str(), window.count, limit)),
                    window: Some(kind),
                    retry_after_seconds: Some(retry_after),
                    remaining: self.remaining(windows),
                };
            }
        }

        QuotaDecision {
            allowed: true,
            reason: None,
            window: None,
            retry_after_seconds: None,
            remaining: self.remaining(windows),
        }
    }

    fn remaining(&self, windows: &[QuotaWindow; 4]) -> BTreeMap<WindowKind, u32> {
        windows
            .iter()
            .map(|w| (w.kind, self.config.limit(w.kind).limit.saturating_sub(w.count)))
            .collect()
    }

    fn ratio(&self, windows: &[QuotaWindow; 4]) -> f64 {
        windows
            .iter()
            .map(|w| {
                let limit = self.config.limit(w.kind).limit;
                if limit == 0 {
                    1.0
                } else {
                    (w.count as f64 / limit as f64).min(1.0)
                }
            })
            .fold(0.0, f64::max)
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<QuotaWindow> = self.lock_windows().to_vec();
        if let Err(e) = save_json(self.store.as_ref(), keys::QUOTA_WINDOWS, &snapshot, None).await {
            warn!(error = %e, "Failed to persist quota windows, continuing in memory");
        }
    }
}
