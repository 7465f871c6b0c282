//! Discovery Guard - resilient company-page discovery
//!
//! A governance layer in front of a rate-limited, occasionally unreliable
//! company-name search provider. Callers use one entry point,
//! [`DiscoveryGuard::discover`], and get either candidates or a well-defined
//! failure.
//!
//! ## Components
//!
//! - **Cache**: two-tier (memory + durable) store of prior results
//! - **Quota**: burst/minute/day/month admission control
//! - **Scheduler**: priority FIFO that serializes provider calls
//! - **Resilience**: per-operation circuit breakers and a fallback chain
//! - **Rollout**: deterministic feature-flag gate
//! - **Telemetry**: rolling metrics, alerts and health probes

pub mod cache;
pub mod clock;
pub mod config;
pub mod housekeeping;
pub mod provider;
pub mod quota;
pub mod resilience;
pub mod rollout;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::{Args, GuardConfig};
pub use service::{DiscoveryGuard, GuardStatus, RestoreReport};
pub use types::{Candidate, Discovery, DiscoverySource, FallbackAction, GuardError, Priority, Result};
