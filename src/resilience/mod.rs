//! Resilience: circuit breakers, retry with backoff, fallback chain, offline mode

mod breaker;
mod controller;
pub mod fallback;
mod heuristic;
mod offline;
mod retry;

pub use breaker::{Admission, BreakerConfig, BreakerState, CircuitBreakers, CircuitState};
pub use controller::{Recovery, ResilienceConfig, ResilienceController, COMPANY_SEARCH};
pub use fallback::{
    ErrorContext, FallbackChain, FallbackConfig, FallbackError, FallbackHandler, FallbackOutcome,
    FallbackResolution, FallbackStrategy,
};
pub use heuristic::{company_slug, heuristic_guess};
pub use offline::{OfflineMode, OfflineState};
pub use retry::Backoff;
