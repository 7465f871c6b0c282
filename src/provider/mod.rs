//! Lookup provider collaborator.
//!
//! The provider turns a company name into candidate company pages. It is
//! rate-limited and occasionally unreliable; everything else in this crate
//! exists to call it as rarely and as safely as possible.

mod http;
pub mod scripted;

pub use http::{HttpProvider, HttpProviderConfig};
pub use scripted::ScriptedProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::Candidate;

/// Errors raised by a provider call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider quota exceeded")]
    Quota { retry_after_seconds: Option<u64> },

    #[error("provider returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid request: {0}")]
    Validation(String),
}

impl ProviderError {
    /// Timeouts, network failures, 5xx and explicit rate-limit signals
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, used in logs and health probes
    fn id(&self) -> &str;

    async fn search(&self, name: &str) -> Result<Vec<Candidate>, ProviderError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

pub type SharedProvider = Arc<dyn Provider>;
