//! Per-operation circuit breakers
//!
//! ```text
//!            threshold failures
//!   CLOSED ─────────────────────► OPEN
//!     ▲                            │ now >= next_retry_at
//!     │ N successes                ▼
//!     └──────────────────────── HALF_OPEN ── any failure ──► OPEN (fresh cooldown)
//! ```
//!
//! Circuit state is created lazily on the first failure and kept for the
//! life of the process. Each operation key is independent.
//!
//! HALF_OPEN admits one trial at a time. A trial that never reports back
//! (dropped future, crash) is abandoned after one cooldown and the next caller
//! gets the slot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{span, SharedClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    pub threshold: u32,
    /// Time the circuit stays open (default: 60 seconds)
    pub cooldown: Duration,
    /// Consecutive half-open successes that close it (default: 2)
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub operation_key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Start of the half-open trial currently in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitState {
    fn closed(operation_key: &str) -> Self {
        Self {
            operation_key: operation_key.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_retry_at: None,
            last_failure_at: None,
            trial_started_at: None,
        }
    }
}

/// Whether a call may go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_at: DateTime<Utc> },
}

pub struct CircuitBreakers {
    config: BreakerConfig,
    clock: SharedClock,
    circuits: DashMap<String, CircuitState>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Gate one call. An open circuit whose cooldown has elapsed moves to
    /// HALF_OPEN and admits a single trial call; other callers are rejected
    /// until the trial reports back through `record_success`,
    /// `record_failure` or `release_trial`.
    pub fn admit(&self, key: &str) -> Admission {
        let now = self.clock.now();
        let Some(mut circuit) = self.circuits.get_mut(key) else {
            return Admission::Allowed;
        };

        let (state, next_retry_at, trial_started_at) =
            (circuit.state, circuit.next_retry_at, circuit.trial_started_at);
        match state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => match trial_started_at {
                Some(started) if now < started + span(self.config.cooldown) => Admission::Rejected {
                    retry_at: started + span(self.config.cooldown),
                },
                _ => {
                    circuit.trial_started_at = Some(now);
                    debug!(operation = %key, "Half-open trial admitted");
                    Admission::Allowed
                }
            },
            BreakerState::Open => match next_retry_at {
                Some(retry_at) if now < retry_at => Admission::Rejected { retry_at },
                _ => {
                    circuit.state = BreakerState::HalfOpen;
                    circuit.consecutive_successes = 0;
                    circuit.trial_started_at = Some(now);
                    info!(operation = %key, "Circuit half-open, allowing trial call");
                    Admission::Allowed
                }
            },
        }
    }

    /// Free the half-open trial slot without counting an outcome
    pub fn release_trial(&self, key: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            circuit.trial_started_at = None;
        }
    }

    /// Returns true when the call closed a half-open circuit
    pub fn record_success(&self, key: &str) -> bool {
        let Some(mut circuit) = self.circuits.get_mut(key) else {
            return false;
        };

        circuit.trial_started_at = None;
        let state = circuit.state;
        match state {
            BreakerState::Closed => {
                circuit.consecutive_failures = 0;
                false
            }
            BreakerState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= self.config.half_open_successes {
                    circuit.state = BreakerState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.consecutive_successes = 0;
                    circuit.next_retry_at = None;
                    info!(operation = %key, "Circuit closed");
                    true
                } else {
                    false
                }
            }
            // A call admitted before the circuit opened; the open state stands
            BreakerState::Open => false,
        }
    }

    /// Count a failure and return the resulting state
    pub fn record_failure(&self, key: &str) -> BreakerState {
        let now = self.clock.now();
        let mut circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| CircuitState::closed(key));

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.consecutive_successes = 0;
        circuit.last_failure_at = Some(now);
        circuit.trial_started_at = None;

        let (state, failures) = (circuit.state, circuit.consecutive_failures);
        match state {
            BreakerState::Closed if failures >= self.config.threshold => {
                circuit.state = BreakerState::Open;
                circuit.next_retry_at = Some(now + span(self.config.cooldown));
                warn!(
                    operation = %key,
                    failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit opened"
                );
            }
            BreakerState::HalfOpen => {
                circuit.state = BreakerState::Open;
                circuit.next_retry_at = Some(now + span(self.config.cooldown));
                warn!(operation = %key, "Trial call failed, circuit reopened");
            }
            _ => {}
        }

        circuit.state
    }

    /// Open the circuit now, as if the threshold had been reached
    pub fn force_open(&self, key: &str) {
        let now = self.clock.now();
        let mut circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| CircuitState::closed(key));
        circuit.state = BreakerState::Open;
        circuit.consecutive_successes = 0;
        circuit.next_retry_at = Some(now + span(self.config.cooldown));
        circuit.trial_started_at = None;
        warn!(operation = %key, "Circuit forced open");
    }

    pub fn reset(&self, key: &str) {
        if self.circuits.remove(key).is_some() {
            info!(operation = %key, "Circuit reset");
        }
    }

    /// Current state without applying the cooldown transition
    pub fn state(&self, key: &str) -> BreakerState {
        self.circuits
            .get(key)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, key: &str) -> CircuitState {
        self.circuits
            .get(key)
            .map(|c| c.clone())
            .unwrap_or_else(|| CircuitState::closed(key))
    }

    pub fn all(&self) -> Vec<CircuitState> {
        let mut all: Vec<_> = self.circuits.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.operation_key.cmp(&b.operation_key));
        all
    }

    pub fn restore(&self, circuits: Vec<CircuitState>) -> usize {
        let count = circuits.len();
        for circuit in circuits {
            self.circuits.insert(circuit.operation_key.clone(), circuit);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breakers() -> (CircuitBreakers, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = BreakerConfig {
            threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_successes: 2,
        };
        (CircuitBreakers::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_full_lifecycle() {
        let (b, clock) = breakers();

        assert_eq!(b.record_failure("X"), BreakerState::Closed);
        assert_eq!(b.record_failure("X"), BreakerState::Closed);
        assert_eq!(b.record_failure("X"), BreakerState::Open);
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));

        clock.advance(Duration::from_secs(60));
        assert_eq!(b.admit("X"), Admission::Allowed);
        assert_eq!(b.state("X"), BreakerState::HalfOpen);

        assert!(!b.record_success("X"));
        assert_eq!(b.state("X"), BreakerState::HalfOpen);
        assert!(b.record_success("X"));
        assert_eq!(b.state("X"), BreakerState::Closed);
        assert_eq!(b.snapshot("X").consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_failure_renews_cooldown() {
        let (b, clock) = breakers();
        for _ in 0..3 {
            b.record_failure("X");
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(b.admit("X"), Admission::Allowed);

        assert_eq!(b.record_failure("X"), BreakerState::Open);
        let retry_at = b.snapshot("X").next_retry_at.unwrap();
        assert_eq!(retry_at, clock_now(&clock) + chrono::Duration::seconds(60));
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));
    }

    #[test]
    fn test_keys_are_isolated() {
        let (b, _) = breakers();
        for _ in 0..3 {
            b.record_failure("X");
        }
        assert_eq!(b.state("X"), BreakerState::Open);
        assert_eq!(b.state("Y"), BreakerState::Closed);
        assert_eq!(b.admit("Y"), Admission::Allowed);
    }

    #[test]
    fn test_success_resets_closed_failures() {
        let (b, _) = breakers();
        b.record_failure("X");
        b.record_failure("X");
        b.record_success("X");
        b.record_failure("X");
        assert_eq!(b.state("X"), BreakerState::Closed);
        assert_eq!(b.snapshot("X").consecutive_failures, 1);
    }

    #[test]
    fn test_force_open_and_reset() {
        let (b, _) = breakers();
        b.force_open("X");
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));
        b.reset("X");
        assert_eq!(b.admit("X"), Admission::Allowed);
        assert!(b.all().is_empty());
    }

    #[test]
    fn test_restore_round_trip() {
        let (b, clock) = breakers();
        b.force_open("company-search");
        let saved = serde_json::to_value(b.all()).unwrap();
        assert_eq!(saved[0]["state"], "OPEN");

        let revived = CircuitBreakers::new(BreakerConfig::default(), clock);
        revived.restore(serde_json::from_value(saved).unwrap());
        assert_eq!(revived.state("company-search"), BreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let (b, clock) = breakers();
        b.force_open("X");
        clock.advance(Duration::from_secs(60));

        assert_eq!(b.admit("X"), Admission::Allowed);
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));

        // First success frees the slot for the next trial
        assert!(!b.record_success("X"));
        assert_eq!(b.admit("X"), Admission::Allowed);
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));
        assert!(b.record_success("X"));
        assert_eq!(b.admit("X"), Admission::Allowed);
        assert_eq!(b.admit("X"), Admission::Allowed);
    }

    #[test]
    fn test_released_trial_frees_slot() {
        let (b, clock) = breakers();
        b.force_open("X");
        clock.advance(Duration::from_secs(60));

        assert_eq!(b.admit("X"), Admission::Allowed);
        b.release_trial("X");
        assert_eq!(b.state("X"), BreakerState::HalfOpen);
        assert_eq!(b.admit("X"), Admission::Allowed);
    }

    #[test]
    fn test_abandoned_trial_expires_after_cooldown() {
        let (b, clock) = breakers();
        b.force_open("X");
        clock.advance(Duration::from_secs(60));
        assert_eq!(b.admit("X"), Admission::Allowed);

        clock.advance(Duration::from_secs(30));
        assert!(matches!(b.admit("X"), Admission::Rejected { .. }));
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.admit("X"), Admission::Allowed);
    }

    fn clock_now(clock: &ManualClock) -> DateTime<Utc> {
        use crate::clock::Clock;
        clock.now()
    }
}
