//! Shared types for discovery-guard

pub mod candidate;
pub mod error;

pub use candidate::{Candidate, Discovery, DiscoverySource, FallbackAction, Priority};
pub use error::{ErrorKind, GuardError, Result};
